//! File and shm backed buffers.

use super::{alloc_pixels, copy_damage, Buffer, BufferKind};
use crate::status::{DboxError, Status};
use crate::types::{Rect, Size};
use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::PathBuf;

#[derive(Debug)]
pub struct FileBuffer {
    identity: String,
    kind: BufferKind,
    path: PathBuf,
    size: Size,
    map: Option<Mmap>,
    pixels: Vec<u8>,
}

impl FileBuffer {
    pub fn open(identity: &str, path: PathBuf, kind: BufferKind, size: Size) -> Result<Self> {
        let mut buffer = Self {
            identity: identity.to_string(),
            kind,
            path,
            size,
            map: None,
            pixels: alloc_pixels(size)?,
        };
        buffer.remap()?;
        Ok(buffer)
    }

    fn expected_len(&self) -> usize {
        self.pixels.len()
    }

    /// The provider may grow the file after we mapped it.
    fn remap(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let map = unsafe { Mmap::map(&file) }.context("mmap buffer")?;
        self.map = Some(map);
        Ok(())
    }
}

impl Buffer for FileBuffer {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn kind(&self) -> BufferKind {
        self.kind
    }

    fn size(&self) -> Size {
        self.size
    }

    fn sync(&mut self, damage: Rect) -> Status {
        let short = self
            .map
            .as_ref()
            .map_or(true, |m| m.len() < self.expected_len());
        if short {
            if let Err(e) = self.remap() {
                tracing::warn!("{}: {e:#}", self.identity);
                return Err(DboxError::Fault);
            }
        }

        let map = self.map.as_ref().ok_or(DboxError::Fault)?;
        copy_damage(map, &mut self.pixels, self.size, damage);
        Ok(())
    }

    fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sync_copies_damaged_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..32).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let identity = format!("file://{}", file.path().display());
        let mut buffer = FileBuffer::open(
            &identity,
            file.path().to_path_buf(),
            BufferKind::File,
            Size::new(4, 2),
        )
        .unwrap();

        assert_eq!(buffer.pixels(), &[0u8; 32][..]);
        buffer.sync(Rect::new(0, 1, 4, 1)).unwrap();
        assert_eq!(&buffer.pixels()[..16], &[0u8; 16]);
        assert_eq!(&buffer.pixels()[16..], &data[16..]);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let result = FileBuffer::open(
            "file:///nonexistent/dbox.png",
            PathBuf::from("/nonexistent/dbox.png"),
            BufferKind::File,
            Size::new(1, 1),
        );
        assert!(result.is_err());
    }
}
