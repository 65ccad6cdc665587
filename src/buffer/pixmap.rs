//! X pixmap backed buffers. The X server serializes access, so no lock.

use super::{alloc_pixels, Buffer, BufferKind};
use crate::status::{DboxError, Status};
use crate::types::{Rect, Size};
use anyhow::{Context, Result};
use std::fmt;
use std::rc::Rc;
use x11rb::protocol::xproto::{ConnectionExt, ImageFormat};
use x11rb::rust_connection::RustConnection;

pub struct PixmapBuffer {
    identity: String,
    pixmap: u32,
    size: Size,
    conn: Rc<RustConnection>,
    pixels: Vec<u8>,
}

impl fmt::Debug for PixmapBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixmapBuffer")
            .field("identity", &self.identity)
            .field("pixmap", &self.pixmap)
            .field("size", &self.size)
            .finish()
    }
}

impl PixmapBuffer {
    pub fn new(identity: &str, conn: Rc<RustConnection>, size: Size) -> Result<Self> {
        let pixmap = parse_pixmap(identity)?;
        Ok(Self {
            identity: identity.to_string(),
            pixmap,
            size,
            conn,
            pixels: alloc_pixels(size)?,
        })
    }

    fn fetch(&mut self, damage: Rect) -> Result<()> {
        let x = damage.x.min(self.size.width);
        let y = damage.y.min(self.size.height);
        let w = damage.w.min(self.size.width - x);
        let h = damage.h.min(self.size.height - y);
        if w == 0 || h == 0 {
            return Ok(());
        }

        let image = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.pixmap,
                i16::try_from(x).context("damage x out of range")?,
                i16::try_from(y).context("damage y out of range")?,
                u16::try_from(w).context("damage width out of range")?,
                u16::try_from(h).context("damage height out of range")?,
                !0,
            )?
            .reply()
            .context("GetImage failed")?;

        let stride = self.size.width as usize * 4;
        let row_len = w as usize * 4;
        for (i, row) in image.data.chunks(row_len).take(h as usize).enumerate() {
            let start = (y as usize + i) * stride + x as usize * 4;
            let end = start + row.len();
            if end > self.pixels.len() {
                break;
            }
            self.pixels[start..end].copy_from_slice(row);
        }
        Ok(())
    }
}

/// `pixmap://1234` -> 1234
pub(crate) fn parse_pixmap(identity: &str) -> Result<u32> {
    identity
        .strip_prefix("pixmap://")
        .context("not a pixmap identity")?
        .parse()
        .context("invalid pixmap id")
}

impl Buffer for PixmapBuffer {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Pixmap
    }

    fn size(&self) -> Size {
        self.size
    }

    fn sync(&mut self, damage: Rect) -> Status {
        self.fetch(damage).map_err(|e| {
            tracing::warn!("{}: {e:#}", self.identity);
            DboxError::Fault
        })
    }

    fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn resource_id(&self) -> Option<u32> {
        Some(self.pixmap)
    }
}
