//! Positional fragment I/O.
//!
//! Fragments address the file by `index * fragment_len`, so reads and
//! writes are seek-based and order independent. The receiving side
//! pre-sizes the destination file and fills it as fragments land.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Debug)]
pub struct FragmentFile {
    file: File,
    size: u64,
    fragment_len: u32,
}

impl FragmentFile {
    /// Open an existing file for sending.
    pub fn open_read(path: &Path, fragment_len: u32) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            fragment_len,
        })
    }

    /// Create (or truncate) the destination file, pre-sized so
    /// out-of-order fragments land without extending it.
    pub fn create_write(path: &Path, size: u64, fragment_len: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file,
            size,
            fragment_len,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of fragments the file divides into. Zero for an empty file.
    pub fn fragment_count(&self) -> u32 {
        self.size.div_ceil(self.fragment_len as u64) as u32
    }

    /// Byte length of fragment `index` (the last one may be short).
    pub fn fragment_size(&self, index: u32) -> u32 {
        let offset = index as u64 * self.fragment_len as u64;
        (self.fragment_len as u64).min(self.size.saturating_sub(offset)) as u32
    }

    pub fn read_fragment(&mut self, index: u32) -> std::io::Result<Vec<u8>> {
        let offset = index as u64 * self.fragment_len as u64;
        let len = self.fragment_size(index) as usize;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_fragment(&mut self, index: u32, data: &[u8]) -> std::io::Result<()> {
        let offset = index as u64 * self.fragment_len as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}
