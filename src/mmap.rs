use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// A read-write memory mapping over a file.
///
/// All shared state in this crate (log buffers, the CnC file) lives in files
/// mapped through this wrapper. Concurrent access is coordinated entirely with
/// atomics placed inside the mapping, never with locks on the wrapper itself.
pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Raw base pointer of the mapping. Callers layer atomics on top of this
    /// for cross-process coordination; plain loads/stores through it must not
    /// race with other mappers.
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pin the mapping into physical memory (mlock). Best effort on platforms
    /// without support.
    pub fn lock(&self) -> Result<()> {
        self.map.lock()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_open_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.dat");

        let mut map = MmapFile::create(&path, 4096).unwrap();
        map.range_mut(100, 5).unwrap().copy_from_slice(b"hello");
        map.flush_sync().unwrap();
        drop(map);

        let map = MmapFile::open(&path).unwrap();
        assert_eq!(map.len(), 4096);
        assert_eq!(map.range(100, 5).unwrap(), b"hello");
    }

    #[test]
    fn range_bounds_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.dat");
        let map = MmapFile::create(&path, 64).unwrap();
        assert!(map.range(60, 8).is_err());
        assert!(map.range(usize::MAX, 2).is_err());
    }

    #[test]
    fn zero_length_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.dat");
        assert!(MmapFile::create(&path, 0).is_err());
    }
}
