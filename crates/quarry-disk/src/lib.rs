//! Disk manager for page-level file I/O.
//!
//! All pages of a database live in a single file, addressed by dense page
//! ids. The disk manager hands out fresh page ids, reuses deallocated ones,
//! and reads/writes whole pages at `page_id * PAGE_SIZE` offsets.

use log::trace;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use quarry_common::{PageId, QuarryError, Result, PAGE_SIZE};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Path of the database file.
    pub db_path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./quarry.db"),
            fsync_enabled: true,
        }
    }
}

impl DiskManagerConfig {
    /// Derives a disk manager config from the engine storage config.
    pub fn from_storage(config: &quarry_common::StorageConfig) -> Self {
        Self {
            db_path: config.db_path.clone(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Manages reading and writing pages to the database file.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// Mutable file state.
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    /// The database file handle.
    file: File,
    /// Number of pages the file has been extended to.
    num_pages: i32,
    /// Deallocated page ids available for reuse.
    free_pages: BTreeSet<i32>,
}

impl DiskManager {
    /// Opens (or creates) the database file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.db_path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as i32;

        Ok(Self {
            config,
            inner: Mutex::new(DiskInner {
                file,
                num_pages,
                free_pages: BTreeSet::new(),
            }),
        })
    }

    /// Returns the database file path.
    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    /// Reads a page from disk into `buf`.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        if !page_id.is_valid() || page_id.raw() >= inner.num_pages {
            return Err(QuarryError::PageNotAllocated {
                page_id: page_id.raw(),
            });
        }

        let offset = (page_id.raw() as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(buf)?;

        Ok(())
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        if !page_id.is_valid() {
            return Err(QuarryError::InvalidPageId {
                page_id: page_id.raw(),
            });
        }

        let offset = (page_id.raw() as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        if page_id.raw() >= inner.num_pages {
            inner.num_pages = page_id.raw() + 1;
        }

        Ok(())
    }

    /// Reserves a fresh page id.
    ///
    /// Previously deallocated ids are reused before the file is extended.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        let reused = inner.free_pages.iter().next().copied();
        if let Some(reused) = reused {
            inner.free_pages.remove(&reused);
            trace!("reusing deallocated page {}", reused);
            return Ok(PageId::new(reused));
        }

        let page_num = inner.num_pages;
        let offset = (page_num as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        inner.num_pages = page_num + 1;
        trace!("allocated page {}", page_num);

        Ok(PageId::new(page_num))
    }

    /// Returns a page id to the free pool.
    pub fn deallocate_page(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        if page_id.is_valid() && page_id.raw() < inner.num_pages {
            inner.free_pages.insert(page_id.raw());
        }
    }

    /// Returns the number of pages in the file (including deallocated ones).
    pub fn num_pages(&self) -> i32 {
        self.inner.lock().num_pages
    }

    /// Returns the number of deallocated pages awaiting reuse.
    pub fn num_free_pages(&self) -> usize {
        self.inner.lock().free_pages.len()
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.inner.lock().file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            db_path: dir.path().join("test.db"),
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.db_path().exists());
        assert_eq!(dm.num_pages(), 0);
    }

    #[test]
    fn test_disk_manager_allocate_sequential() {
        let (dm, _dir) = create_test_disk_manager();

        assert_eq!(dm.allocate_page().unwrap(), PageId::new(0));
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(1));
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(2));
        assert_eq!(dm.num_pages(), 3);
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();
        assert_eq!(read_data[0], 0xAB);
        assert_eq!(read_data[100], 0xCD);
        assert_eq!(read_data[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_read_unallocated_page() {
        let (dm, _dir) = create_test_disk_manager();

        dm.allocate_page().unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        let result = dm.read_page(PageId::new(99), &mut buf);
        assert!(matches!(
            result,
            Err(QuarryError::PageNotAllocated { page_id: 99 })
        ));
    }

    #[test]
    fn test_disk_manager_read_invalid_page() {
        let (dm, _dir) = create_test_disk_manager();

        let mut buf = [0u8; PAGE_SIZE];
        assert!(dm.read_page(PageId::INVALID, &mut buf).is_err());
    }

    #[test]
    fn test_disk_manager_overwrite_page() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data1 = [0u8; PAGE_SIZE];
        data1[0] = 0xAA;
        dm.write_page(page_id, &data1).unwrap();

        let mut data2 = [0u8; PAGE_SIZE];
        data2[0] = 0xBB;
        dm.write_page(page_id, &data2).unwrap();

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();
        assert_eq!(read_data[0], 0xBB);
    }

    #[test]
    fn test_disk_manager_deallocate_and_reuse() {
        let (dm, _dir) = create_test_disk_manager();

        let p0 = dm.allocate_page().unwrap();
        let p1 = dm.allocate_page().unwrap();
        let p2 = dm.allocate_page().unwrap();
        assert_eq!(dm.num_free_pages(), 0);

        dm.deallocate_page(p1);
        assert_eq!(dm.num_free_pages(), 1);

        // Reuses the freed id before extending the file.
        let reused = dm.allocate_page().unwrap();
        assert_eq!(reused, p1);
        assert_eq!(dm.num_free_pages(), 0);
        assert_eq!(dm.num_pages(), 3);

        let fresh = dm.allocate_page().unwrap();
        assert_eq!(fresh, PageId::new(3));

        // Untouched ids stay allocated.
        let mut buf = [0u8; PAGE_SIZE];
        dm.read_page(p0, &mut buf).unwrap();
        dm.read_page(p2, &mut buf).unwrap();
    }

    #[test]
    fn test_disk_manager_deallocate_invalid_ignored() {
        let (dm, _dir) = create_test_disk_manager();

        dm.deallocate_page(PageId::INVALID);
        dm.deallocate_page(PageId::new(50));
        assert_eq!(dm.num_free_pages(), 0);
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("persist.db");
        let page_id;

        {
            let config = DiskManagerConfig {
                db_path: db_path.clone(),
                fsync_enabled: true,
            };
            let dm = DiskManager::new(config).unwrap();
            page_id = dm.allocate_page().unwrap();

            let mut data = [0u8; PAGE_SIZE];
            data[0] = 0xFF;
            dm.write_page(page_id, &data).unwrap();
        }

        {
            let config = DiskManagerConfig {
                db_path,
                fsync_enabled: true,
            };
            let dm = DiskManager::new(config).unwrap();
            assert_eq!(dm.num_pages(), 1);

            let mut read_data = [0u8; PAGE_SIZE];
            dm.read_page(page_id, &mut read_data).unwrap();
            assert_eq!(read_data[0], 0xFF);
        }
    }

    #[test]
    fn test_disk_manager_config_from_storage() {
        let storage = quarry_common::StorageConfig {
            db_path: PathBuf::from("/var/lib/quarry/main.db"),
            fsync_enabled: false,
            ..Default::default()
        };

        let config = DiskManagerConfig::from_storage(&storage);
        assert_eq!(config.db_path, storage.db_path);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_disk_manager_flush() {
        let (dm, _dir) = create_test_disk_manager();

        dm.allocate_page().unwrap();
        dm.flush().unwrap();
    }
}
