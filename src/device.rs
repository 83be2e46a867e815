//! Block device interface.
//!
//! Every component of the engine shares one [`BlockStream`] through an
//! `Arc<dyn BlockStream>`. The trait is byte-granular: FAT entries,
//! directory slots and cluster payloads all live at arbitrary byte
//! offsets, so the device wrapper deals in positioned reads and writes
//! rather than whole blocks.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use spin::Mutex;

use crate::error::Result;

pub trait BlockStream: Send + Sync {
    /// Read `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Total size of the backing device in bytes.
    fn size(&self) -> u64;

    /// Whether writes are accepted. Lazy allocation clamps instead of
    /// growing when this is false.
    fn writable(&self) -> bool;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A disk image file.
pub struct FileStream {
    file: Mutex<File>,
    size: u64,
    writable: bool,
}

impl FileStream {
    /// Create (or truncate) an image file of `size` bytes.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file: Mutex::new(file),
            size,
            writable: true,
        })
    }

    /// Open an existing image or raw partition read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
            writable: true,
        })
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
            writable: false,
        })
    }
}

impl BlockStream for FileStream {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        // A formatted image may be physically shorter than the volume it
        // describes; unwritten space reads back as zeroes.
        let mut done = 0;
        while done < buf.len() {
            let n = file.read(&mut buf[done..])?;
            if n == 0 {
                buf[done..].fill(0);
                break;
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().flush()?;
        Ok(())
    }
}

/// A fixed-size in-memory device, handy for building synthetic images
/// and for tests.
pub struct MemStream {
    data: spin::RwLock<Vec<u8>>,
    writable: bool,
}

impl MemStream {
    pub fn new(size: u64) -> Self {
        Self {
            data: spin::RwLock::new(vec![0u8; size as usize]),
            writable: true,
        }
    }

    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            data: spin::RwLock::new(data),
            writable: false,
        }
    }

    /// Snapshot of the raw image.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl BlockStream for MemStream {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} past device end", buf.len(), offset),
            )
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("write of {} bytes at {} past device end", buf.len(), offset),
            )
            .into());
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn writable(&self) -> bool {
        self.writable
    }
}

/// Convenience alias used throughout the engine.
pub type SharedStream = Arc<dyn BlockStream>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_stream_round_trip() {
        let s = MemStream::new(1024);
        s.write_at(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        s.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mem_stream_bounds() {
        let s = MemStream::new(16);
        assert!(s.write_at(12, b"xxxxx").is_err());
        let mut buf = [0u8; 5];
        assert!(s.read_at(12, &mut buf).is_err());
    }
}
