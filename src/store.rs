// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use enum_dispatch::enum_dispatch;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::RwLock;

/// Disk address of a page (byte offset into the store)
pub type PageAddr = u64;

/// Sentinel for "no page"
///
/// Address 0 is the super page, which is never linked to.
pub const NIL_ADDR: PageAddr = 0;

/// On-disk page type tag (first byte of every page)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageType {
    /// Unallocated page
    Free,

    /// Page 0: allocator state, log shard heads
    Super,

    /// B-tree leaf (sorted key → message cells)
    BtreeLeaf,

    /// B-tree index (sorted pivot → child cells)
    BtreeIndex,

    /// Serialized routing filter
    Filter,

    /// Write-ahead log page
    Log,
}

impl TryFrom<u8> for PageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Super),
            2 => Ok(Self::BtreeLeaf),
            3 => Ok(Self::BtreeIndex),
            4 => Ok(Self::Filter),
            5 => Ok(Self::Log),
            _ => Err(()),
        }
    }
}

impl From<PageType> for u8 {
    fn from(value: PageType) -> Self {
        match value {
            PageType::Free => 0,
            PageType::Super => 1,
            PageType::BtreeLeaf => 2,
            PageType::BtreeIndex => 3,
            PageType::Filter => 4,
            PageType::Log => 5,
        }
    }
}

/// Fixed-size page I/O against a backing medium
#[enum_dispatch]
pub trait PageIo {
    /// Reads the page at `addr` into `buf`.
    fn read_page(&self, addr: PageAddr, buf: &mut [u8]) -> crate::Result<()>;

    /// Writes `buf` as the page at `addr`.
    fn write_page(&self, addr: PageAddr, buf: &[u8]) -> crate::Result<()>;

    /// Flushes written pages to the medium.
    fn sync(&self) -> crate::Result<()>;

    /// Size of the medium in bytes.
    fn capacity(&self) -> u64;
}

/// Page store backend, selected by config
#[enum_dispatch(PageIo)]
pub enum PageStore {
    /// Single-file backend
    File(FileStore),

    /// In-memory backend (tests, ephemeral stores)
    Dram(DramStore),
}

/// Page store over a single pre-sized file
pub struct FileStore {
    file: File,
    capacity: u64,
}

impl FileStore {
    /// Creates the store file, sized to `capacity` bytes.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> crate::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        file.sync_all()?;

        Ok(Self { file, capacity })
    }

    /// Opens an existing store file.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len();

        Ok(Self { file, capacity })
    }
}

impl PageIo for FileStore {
    #[cfg(unix)]
    fn read_page(&self, addr: PageAddr, buf: &mut [u8]) -> crate::Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.read_exact_at(buf, addr)?;
        Ok(())
    }

    #[cfg(windows)]
    fn read_page(&self, addr: PageAddr, buf: &mut [u8]) -> crate::Result<()> {
        use std::os::windows::fs::FileExt;

        let mut pos = 0;
        while pos < buf.len() {
            let n = self.file.seek_read(&mut buf[pos..], addr + pos as u64)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            pos += n;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_page(&self, addr: PageAddr, buf: &[u8]) -> crate::Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.write_all_at(buf, addr)?;
        Ok(())
    }

    #[cfg(windows)]
    fn write_page(&self, addr: PageAddr, buf: &[u8]) -> crate::Result<()> {
        use std::os::windows::fs::FileExt;

        let mut pos = 0;
        while pos < buf.len() {
            let n = self.file.seek_write(&buf[pos..], addr + pos as u64)?;
            pos += n;
        }
        Ok(())
    }

    fn sync(&self) -> crate::Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Page store over a heap buffer
pub struct DramStore {
    data: RwLock<Vec<u8>>,
}

impl DramStore {
    /// Creates an in-memory store of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self {
            data: RwLock::new(vec![0; capacity as usize]),
        }
    }
}

impl PageIo for DramStore {
    #[allow(clippy::expect_used)]
    fn read_page(&self, addr: PageAddr, buf: &mut [u8]) -> crate::Result<()> {
        let data = self.data.read().expect("lock is poisoned");

        #[allow(clippy::cast_possible_truncation)]
        let start = addr as usize;
        let end = start + buf.len();

        let Some(src) = data.get(start..end) else {
            return Err(crate::Error::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        };

        buf.copy_from_slice(src);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn write_page(&self, addr: PageAddr, buf: &[u8]) -> crate::Result<()> {
        let mut data = self.data.write().expect("lock is poisoned");

        #[allow(clippy::cast_possible_truncation)]
        let start = addr as usize;
        let end = start + buf.len();

        let Some(dst) = data.get_mut(start..end) else {
            return Err(crate::Error::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        };

        dst.copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> crate::Result<()> {
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn capacity(&self) -> u64 {
        self.data.read().expect("lock is poisoned").len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn dram_store_round_trip() -> crate::Result<()> {
        let store = DramStore::new(16 * 4_096);

        let page = vec![0xAB; 4_096];
        store.write_page(4_096, &page)?;

        let mut buf = vec![0; 4_096];
        store.read_page(4_096, &mut buf)?;
        assert_eq!(page, buf);

        Ok(())
    }

    #[test]
    fn file_store_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store");

        let store = FileStore::create(&path, 16 * 4_096)?;
        let page = vec![0xCD; 4_096];
        store.write_page(2 * 4_096, &page)?;
        store.sync()?;
        drop(store);

        let store = FileStore::open(&path)?;
        assert_eq!(16 * 4_096, store.capacity());

        let mut buf = vec![0; 4_096];
        store.read_page(2 * 4_096, &mut buf)?;
        assert_eq!(page, buf);

        Ok(())
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let store = DramStore::new(4_096);
        let mut buf = vec![0; 4_096];
        assert!(store.read_page(4_096, &mut buf).is_err());
    }
}
