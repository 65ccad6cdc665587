//! Pixel buffers owned by a surface.
//!
//! A buffer is named by an identity URI chosen by the provider:
//! `file:///path`, `shm://key` or `pixmap://id`. The viewer never writes to
//! a buffer; it only copies damaged regions out into a private copy.

mod file;
mod lock;
mod pixmap;

pub use file::FileBuffer;
pub use lock::{LockGuard, ReadLock};
pub use pixmap::PixmapBuffer;

use crate::status::Status;
use crate::types::{Rect, Size};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use x11rb::rust_connection::RustConnection;

const SHM_DIR: &str = "/dev/shm";

/// Largest surface edge a provider may announce.
pub const MAX_EDGE: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    File,
    Shm,
    Pixmap,
    Error,
}

impl BufferKind {
    /// Kind implied by an identity URI.
    pub fn of(identity: &str) -> Self {
        if identity.starts_with("file://") {
            BufferKind::File
        } else if identity.starts_with("shm://") {
            BufferKind::Shm
        } else if identity.starts_with("pixmap://") {
            BufferKind::Pixmap
        } else {
            BufferKind::Error
        }
    }

    /// File and shm buffers are written by another process without any
    /// synchronization of their own and need the advisory lock.
    pub fn needs_lock(self) -> bool {
        matches!(self, BufferKind::File | BufferKind::Shm)
    }
}

pub trait Buffer: fmt::Debug {
    fn identity(&self) -> &str;

    fn kind(&self) -> BufferKind;

    fn size(&self) -> Size;

    /// Copy `damage` out of the shared resource into the private pixels.
    fn sync(&mut self, damage: Rect) -> Status;

    /// Last synced pixels, 32bpp row-major.
    fn pixels(&self) -> &[u8];

    /// Platform resource id, if the buffer has one.
    fn resource_id(&self) -> Option<u32> {
        None
    }
}

/// Creates buffers from identity URIs. Destroying a buffer is dropping it.
pub trait BufferBackend {
    fn create(&mut self, identity: &str, size: Size) -> Option<Box<dyn Buffer>>;
}

/// Backend for real providers: files, `/dev/shm` segments and X pixmaps.
#[derive(Default)]
pub struct SystemBackend {
    x11: Option<Rc<RustConnection>>,
}

impl fmt::Debug for SystemBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemBackend")
            .field("x11", &self.x11.is_some())
            .finish()
    }
}

impl SystemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn x11(&mut self) -> Option<Rc<RustConnection>> {
        if self.x11.is_none() {
            match x11rb::connect(None) {
                Ok((conn, _screen)) => self.x11 = Some(Rc::new(conn)),
                Err(e) => {
                    tracing::warn!("pixmap buffers unavailable: {e}");
                    return None;
                }
            }
        }
        self.x11.clone()
    }
}

impl BufferBackend for SystemBackend {
    fn create(&mut self, identity: &str, size: Size) -> Option<Box<dyn Buffer>> {
        let result: anyhow::Result<Box<dyn Buffer>> = match BufferKind::of(identity) {
            BufferKind::File => {
                let path = PathBuf::from(&identity["file://".len()..]);
                FileBuffer::open(identity, path, BufferKind::File, size)
                    .map(|b| Box::new(b) as Box<dyn Buffer>)
            }
            BufferKind::Shm => {
                let path = PathBuf::from(SHM_DIR).join(&identity["shm://".len()..]);
                FileBuffer::open(identity, path, BufferKind::Shm, size)
                    .map(|b| Box::new(b) as Box<dyn Buffer>)
            }
            BufferKind::Pixmap => {
                let conn = self.x11()?;
                PixmapBuffer::new(identity, conn, size).map(|b| Box::new(b) as Box<dyn Buffer>)
            }
            BufferKind::Error => Err(anyhow::anyhow!("unknown buffer scheme")),
        };

        match result {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                tracing::warn!("buffer {identity}: {e:#}");
                None
            }
        }
    }
}

/// Zeroed private copy of a `size` surface. An announced size that cannot
/// be held fails here instead of taking the process down.
pub(crate) fn alloc_pixels(size: Size) -> Result<Vec<u8>> {
    if size.width > MAX_EDGE || size.height > MAX_EDGE {
        bail!("surface {}x{} exceeds {MAX_EDGE}", size.width, size.height);
    }
    let len = usize::try_from(size.width)?
        .checked_mul(usize::try_from(size.height)?)
        .and_then(|n| n.checked_mul(4))
        .context("surface size overflows")?;
    let mut pixels = Vec::new();
    pixels
        .try_reserve_exact(len)
        .context("cannot allocate surface")?;
    pixels.resize(len, 0);
    Ok(pixels)
}

/// Copy `damage` out of `src` (a `size`-shaped 32bpp image) into `dst`.
/// Rows beyond the end of `src` are left untouched.
pub(crate) fn copy_damage(src: &[u8], dst: &mut [u8], size: Size, damage: Rect) {
    let stride = size.width as usize * 4;
    let x = damage.x.min(size.width) as usize;
    let y = damage.y.min(size.height) as usize;
    let w = (damage.w as usize).min(size.width as usize - x);
    let h = (damage.h as usize).min(size.height as usize - y);

    for row in y..y + h {
        let start = row * stride + x * 4;
        let end = start + w * 4;
        if end > src.len() || end > dst.len() {
            break;
        }
        dst[start..end].copy_from_slice(&src[start..end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_identity() {
        assert_eq!(BufferKind::of("file:///tmp/a.png"), BufferKind::File);
        assert_eq!(BufferKind::of("shm://1234"), BufferKind::Shm);
        assert_eq!(BufferKind::of("pixmap://77"), BufferKind::Pixmap);
        assert_eq!(BufferKind::of("/tmp/a.png"), BufferKind::Error);
        assert!(BufferKind::Shm.needs_lock());
        assert!(!BufferKind::Pixmap.needs_lock());
    }

    #[test]
    fn test_copy_damage_clips() {
        let size = Size::new(2, 2);
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 16];
        copy_damage(&src, &mut dst, size, Rect::new(1, 1, 10, 10));
        assert_eq!(&dst[..12], &[0u8; 12]);
        assert_eq!(&dst[12..], &[12, 13, 14, 15]);
    }

    #[test]
    fn test_alloc_pixels_bounds() {
        assert_eq!(alloc_pixels(Size::new(3, 2)).unwrap().len(), 24);
        assert!(alloc_pixels(Size::new(0, 0)).unwrap().is_empty());
        assert!(alloc_pixels(Size::new(MAX_EDGE + 1, 1)).is_err());
        assert!(alloc_pixels(Size::new(u32::MAX, u32::MAX)).is_err());
    }

    #[test]
    fn test_oversized_file_buffer_is_refused() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let identity = format!("file://{}", file.path().display());
        let mut backend = SystemBackend::new();
        assert!(backend
            .create(&identity, Size::new(100_000, 100_000))
            .is_none());
        assert!(backend.create(&identity, Size::new(4, 4)).is_some());
    }

    #[test]
    fn test_system_backend_rejects_unknown_scheme() {
        let mut backend = SystemBackend::new();
        assert!(backend.create("bogus", Size::new(1, 1)).is_none());
    }
}
