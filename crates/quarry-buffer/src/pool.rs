//! Buffer pool manager.

use log::trace;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use sysinfo::System;

use crate::frame::{Frame, FrameId};
use crate::hash_table::{ExtendibleHashTable, DEFAULT_BUCKET_CAPACITY};
use crate::replacer::{LruReplacer, Replacer};
use quarry_common::{PageId, QuarryError, Result, PAGE_SIZE};
use quarry_disk::DiskManager;

/// Buffer pool manager.
///
/// Owns a fixed array of frames, the page table mapping resident page ids to
/// frames, the free list, and the LRU replacer. Absent pages are materialised
/// from the disk manager after evicting a victim; dirty victims are written
/// back first.
///
/// A single coarse latch serialises structural mutation. Every resident frame
/// with a zero pin count is either in the replacer or (if never used or
/// deleted) in the free list, and in exactly one of the two.
pub struct BufferPoolManager {
    /// Number of frames in the pool.
    pool_size: usize,
    /// Array of buffer frames.
    frames: Vec<Frame>,
    /// Resident page id to frame id mapping.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Eviction policy over unpinned frames.
    replacer: LruReplacer<FrameId>,
    /// Frames holding no page.
    free_list: Mutex<VecDeque<FrameId>>,
    /// Backing store.
    disk: Arc<DiskManager>,
    /// Coarse latch serialising structural mutation.
    latch: Mutex<()>,
}

impl BufferPoolManager {
    /// Creates a buffer pool with `pool_size` frames over `disk`.
    pub fn new(pool_size: usize, disk: Arc<DiskManager>) -> Self {
        assert!(pool_size > 0, "pool size must be positive");

        let frames: Vec<_> = (0..pool_size)
            .map(|i| Frame::new(FrameId(i as u32)))
            .collect();
        let free_list: VecDeque<_> = (0..pool_size).map(|i| FrameId(i as u32)).collect();

        Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::new(DEFAULT_BUCKET_CAPACITY),
            replacer: LruReplacer::new(),
            free_list: Mutex::new(free_list),
            disk,
            latch: Mutex::new(()),
        }
    }

    /// Creates a buffer pool sized from the engine storage config.
    pub fn with_config(config: &quarry_common::StorageConfig, disk: Arc<DiskManager>) -> Self {
        Self::new(config.buffer_pool_frames, disk)
    }

    /// Creates a buffer pool sized to 25% of available system RAM, with a
    /// floor of 1024 frames.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let pool_size = (target_bytes / PAGE_SIZE).max(1024);

        Self::new(pool_size, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns true if `page_id` is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.find(page_id).is_some()
    }

    /// Returns the backing disk manager.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub(crate) fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id.0 as usize]
    }

    /// Fetches a page, pinning its frame.
    ///
    /// Resident pages are pinned in place; absent pages are read from disk
    /// into a victim frame (free list first, then the replacer). Fails with
    /// `InvalidPageId` for an invalid id and `BufferPoolFull` when every
    /// frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let _latch = self.latch.lock();

        if !page_id.is_valid() {
            return Err(QuarryError::InvalidPageId {
                page_id: page_id.raw(),
            });
        }

        if let Some(frame_id) = self.page_table.find(page_id) {
            let frame = self.frame(frame_id);
            if frame.pin_count() == 0 {
                self.replacer.erase(frame_id);
            }
            frame.pin();
            return Ok(PageGuard::new(self, page_id, frame_id));
        }

        let frame_id = self.acquire_victim()?;
        let frame = self.frame(frame_id);

        {
            let mut data = frame.write_data();
            if let Err(e) = self.disk.read_page(page_id, &mut data) {
                drop(data);
                frame.reset();
                self.free_list.lock().push_back(frame_id);
                return Err(e);
            }
        }

        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        Ok(PageGuard::new(self, page_id, frame_id))
    }

    /// Allocates a fresh page and pins it in a zeroed frame.
    ///
    /// Fails with `BufferPoolFull` when the free list and the replacer are
    /// both empty.
    pub fn new_page(&self) -> Result<(PageId, PageGuard<'_>)> {
        let _latch = self.latch.lock();

        if self.free_list.lock().is_empty() && self.replacer.size() == 0 {
            return Err(QuarryError::BufferPoolFull);
        }

        let page_id = self.disk.allocate_page()?;
        let frame_id = self.acquire_victim()?;
        let frame = self.frame(frame_id);

        {
            let mut data = frame.write_data();
            data.fill(0);
        }
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        Ok((page_id, PageGuard::new(self, page_id, frame_id)))
    }

    /// Drops one pin on `page_id`.
    ///
    /// Returns false when the page is not resident or its pin count is
    /// already zero. The dirty hint is OR-ed into the frame's dirty flag and
    /// never clears it. A frame reaching pin count zero becomes evictable.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _latch = self.latch.lock();

        let Some(frame_id) = self.page_table.find(page_id) else {
            return false;
        };
        let frame = self.frame(frame_id);
        if frame.pin_count() == 0 {
            return false;
        }

        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.insert(frame_id);
        }
        true
    }

    /// Writes a resident page back to disk.
    ///
    /// Alters neither the pin count, the dirty flag, nor replacer state.
    /// Returns false when `page_id` is invalid or not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let _latch = self.latch.lock();

        if !page_id.is_valid() {
            return Ok(false);
        }
        let Some(frame_id) = self.page_table.find(page_id) else {
            return Ok(false);
        };

        let frame = self.frame(frame_id);
        let data = frame.read_data();
        self.disk.write_page(page_id, &data)?;
        Ok(true)
    }

    /// Writes every resident dirty frame back to disk (shutdown path).
    ///
    /// Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let _latch = self.latch.lock();

        let mut flushed = 0;
        for frame in &self.frames {
            let page_id = frame.page_id();
            if page_id.is_valid() && frame.is_dirty() {
                let data = frame.read_data();
                self.disk.write_page(page_id, &data)?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Deletes a page, returning its frame to the free list.
    ///
    /// Returns false when the page is resident and pinned. The page id is
    /// deallocated on disk either way.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let _latch = self.latch.lock();

        if let Some(frame_id) = self.page_table.find(page_id) {
            let frame = self.frame(frame_id);
            if frame.is_pinned() {
                return Ok(false);
            }

            self.page_table.remove(page_id);
            self.replacer.erase(frame_id);
            frame.reset();
            self.free_list.lock().push_back(frame_id);
        }

        self.disk.deallocate_page(page_id);
        Ok(true)
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut used = 0;
        let mut pinned = 0;
        let mut dirty = 0;

        for frame in &self.frames {
            if frame.page_id().is_valid() {
                used += 1;
                if frame.is_pinned() {
                    pinned += 1;
                }
                if frame.is_dirty() {
                    dirty += 1;
                }
            }
        }

        BufferPoolStats {
            total_frames: self.pool_size,
            free_frames: self.free_count(),
            used_frames: used,
            pinned_frames: pinned,
            dirty_frames: dirty,
        }
    }

    /// Picks a victim frame: free list first, then the replacer.
    ///
    /// A dirty victim is written back and its old page-table binding removed.
    fn acquire_victim(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.victim().ok_or(QuarryError::BufferPoolFull)?;
        let frame = self.frame(frame_id);

        if frame.is_dirty() {
            let data = frame.read_data();
            if let Err(e) = self.disk.write_page(frame.page_id(), &data) {
                drop(data);
                self.replacer.insert(frame_id);
                return Err(e);
            }
            drop(data);
            frame.set_dirty(false);
            trace!("wrote back dirty page {} on eviction", frame.page_id());
        }

        let old_page_id = frame.page_id();
        if old_page_id.is_valid() {
            self.page_table.remove(old_page_id);
            trace!("evicted page {} from {}", old_page_id, frame_id);
        }
        frame.set_page_id(PageId::INVALID);

        Ok(frame_id)
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with a resident page.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// RAII pin on a resident page.
///
/// Returned by [`BufferPoolManager::fetch_page`] and
/// [`BufferPoolManager::new_page`]; dropping the guard releases exactly one
/// pin, passing the accumulated dirty mark to `unpin_page`. Mutable access
/// through [`PageGuard::data_mut`] marks the guard dirty.
pub struct PageGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame_id: FrameId,
    dirty: bool,
}

impl<'a> PageGuard<'a> {
    fn new(pool: &'a BufferPoolManager, page_id: PageId, frame_id: FrameId) -> Self {
        Self {
            pool,
            page_id,
            frame_id,
            dirty: false,
        }
    }

    /// Returns the pinned page's id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns read access to the page bytes.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.pool.frame(self.frame_id).read_data()
    }

    /// Returns write access to the page bytes and marks the guard dirty.
    pub fn data_mut(&mut self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.dirty = true;
        self.pool.frame(self.frame_id).write_data()
    }

    /// Marks the guard dirty without touching the data.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty);
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("frame_id", &self.frame_id)
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_disk::DiskManagerConfig;
    use tempfile::tempdir;

    fn create_test_pool(pool_size: usize) -> (Arc<BufferPoolManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                db_path: dir.path().join("pool.db"),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        (Arc::new(BufferPoolManager::new(pool_size, disk)), dir)
    }

    #[test]
    fn test_pool_new() {
        let (pool, _dir) = create_test_pool(10);

        assert_eq!(pool.pool_size(), 10);
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_pool_with_config() {
        let dir = tempdir().unwrap();
        let storage = quarry_common::StorageConfig {
            db_path: dir.path().join("configured.db"),
            buffer_pool_frames: 5,
            fsync_enabled: false,
            ..Default::default()
        };
        let disk = DiskManager::new(DiskManagerConfig::from_storage(&storage)).unwrap();

        let pool = BufferPoolManager::with_config(&storage, Arc::new(disk));
        assert_eq!(pool.pool_size(), 5);
        assert_eq!(pool.free_count(), 5);
    }

    #[test]
    fn test_pool_new_page_is_pinned() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, guard) = pool.new_page().unwrap();
        assert_eq!(page_id, PageId::new(0));
        assert!(pool.contains(page_id));
        assert_eq!(pool.free_count(), 9);

        let stats = pool.stats();
        assert_eq!(stats.pinned_frames, 1);
        drop(guard);
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_pool_fetch_invalid_page() {
        let (pool, _dir) = create_test_pool(10);

        assert!(matches!(
            pool.fetch_page(PageId::INVALID),
            Err(QuarryError::InvalidPageId { page_id: -1 })
        ));
    }

    #[test]
    fn test_pool_fetch_resident_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, mut guard) = pool.new_page().unwrap();
        guard.data_mut()[0] = 0xAB;
        drop(guard);

        let guard = pool.fetch_page(page_id).unwrap();
        assert_eq!(guard.data()[0], 0xAB);
    }

    #[test]
    fn test_pool_fetch_from_disk() {
        let (pool, _dir) = create_test_pool(1);

        // Write p0 through the pool, then evict it by touching p1.
        let (p0, mut guard) = pool.new_page().unwrap();
        guard.data_mut()[7] = 0x77;
        drop(guard);

        let (_p1, guard) = pool.new_page().unwrap();
        drop(guard);
        assert!(!pool.contains(p0));

        // Fetch reads p0 back from disk.
        let guard = pool.fetch_page(p0).unwrap();
        assert_eq!(guard.data()[7], 0x77);
    }

    #[test]
    fn test_pool_unpin_absent_page() {
        let (pool, _dir) = create_test_pool(10);
        assert!(!pool.unpin_page(PageId::new(5), false));
    }

    #[test]
    fn test_pool_unpin_already_zero() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, guard) = pool.new_page().unwrap();
        drop(guard);
        assert!(!pool.unpin_page(page_id, false));
    }

    #[test]
    fn test_pool_dirty_hint_never_clears() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, mut guard) = pool.new_page().unwrap();
        guard.data_mut()[0] = 1;
        drop(guard); // unpin with dirty = true

        // A clean unpin afterwards must not clear the dirty flag.
        let guard = pool.fetch_page(page_id).unwrap();
        drop(guard);
        assert_eq!(pool.stats().dirty_frames, 1);
    }

    #[test]
    fn test_pool_exhaustion_and_recovery() {
        let (pool, _dir) = create_test_pool(3);

        let (p0, g0) = pool.new_page().unwrap();
        let (_p1, _g1) = pool.new_page().unwrap();
        let (_p2, _g2) = pool.new_page().unwrap();

        // All frames pinned: no frame obtainable.
        assert!(matches!(pool.new_page(), Err(QuarryError::BufferPoolFull)));

        // Unpinning one page makes its frame the victim.
        drop(g0);
        let (p3, _g3) = pool.new_page().unwrap();
        assert!(pool.contains(p3));
        assert!(!pool.contains(p0));
    }

    #[test]
    fn test_pool_eviction_writes_back_dirty() {
        let (pool, _dir) = create_test_pool(1);

        let (p0, mut guard) = pool.new_page().unwrap();
        guard.data_mut()[0] = 0xCD;
        drop(guard);

        // Evicting p0 must write it back before p1 takes the frame.
        let (_p1, guard) = pool.new_page().unwrap();
        drop(guard);

        let mut buf = [0u8; PAGE_SIZE];
        pool.disk().read_page(p0, &mut buf).unwrap();
        assert_eq!(buf[0], 0xCD);
    }

    #[test]
    fn test_pool_clean_eviction_skips_write() {
        let (pool, _dir) = create_test_pool(1);

        let (p0, guard) = pool.new_page().unwrap();
        drop(guard); // clean unpin

        let (_p1, guard) = pool.new_page().unwrap();
        drop(guard);

        // p0 was never written back; its disk image is still zeroed.
        let mut buf = [0u8; PAGE_SIZE];
        pool.disk().read_page(p0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; PAGE_SIZE]);
    }

    #[test]
    fn test_pool_lru_eviction_order() {
        let (pool, _dir) = create_test_pool(3);

        let (p0, g0) = pool.new_page().unwrap();
        let (p1, g1) = pool.new_page().unwrap();
        let (p2, g2) = pool.new_page().unwrap();
        drop(g0);
        drop(g1);
        drop(g2);

        // Re-touch p0 so p1 becomes least recently used.
        drop(pool.fetch_page(p0).unwrap());

        let (_p3, _g3) = pool.new_page().unwrap();
        assert!(pool.contains(p0));
        assert!(!pool.contains(p1));
        assert!(pool.contains(p2));
    }

    #[test]
    fn test_pool_flush_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, mut guard) = pool.new_page().unwrap();
        guard.data_mut()[0] = 0x42;
        drop(guard);

        assert!(pool.flush_page(page_id).unwrap());

        let mut buf = [0u8; PAGE_SIZE];
        pool.disk().read_page(page_id, &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);

        // Flushing leaves the dirty flag alone; only eviction clears it.
        assert_eq!(pool.stats().dirty_frames, 1);
    }

    #[test]
    fn test_pool_flush_page_absent() {
        let (pool, _dir) = create_test_pool(10);

        assert!(!pool.flush_page(PageId::new(3)).unwrap());
        assert!(!pool.flush_page(PageId::INVALID).unwrap());
    }

    #[test]
    fn test_pool_flush_all() {
        let (pool, _dir) = create_test_pool(10);

        let mut page_ids = Vec::new();
        for i in 0..5u8 {
            let (page_id, mut guard) = pool.new_page().unwrap();
            guard.data_mut()[0] = i;
            page_ids.push(page_id);
        }

        assert_eq!(pool.flush_all().unwrap(), 5);

        for (i, page_id) in page_ids.iter().enumerate() {
            let mut buf = [0u8; PAGE_SIZE];
            pool.disk().read_page(*page_id, &mut buf).unwrap();
            assert_eq!(buf[0], i as u8);
        }
    }

    #[test]
    fn test_pool_delete_page_returns_frame_to_free_list() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, guard) = pool.new_page().unwrap();
        drop(guard);
        assert_eq!(pool.free_count(), 9);

        assert!(pool.delete_page(page_id).unwrap());
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.disk().num_free_pages(), 1);
    }

    #[test]
    fn test_pool_delete_pinned_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _guard) = pool.new_page().unwrap();

        assert!(!pool.delete_page(page_id).unwrap());
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_pool_delete_non_resident_page() {
        let (pool, _dir) = create_test_pool(2);

        let (p0, g) = pool.new_page().unwrap();
        drop(g);
        let (_p1, g) = pool.new_page().unwrap();
        drop(g);
        let (_p2, g) = pool.new_page().unwrap(); // evicts p0
        drop(g);
        assert!(!pool.contains(p0));

        assert!(pool.delete_page(p0).unwrap());
        assert_eq!(pool.disk().num_free_pages(), 1);
    }

    #[test]
    fn test_pool_stats() {
        let (pool, _dir) = create_test_pool(10);

        let (_p0, mut g0) = pool.new_page().unwrap();
        g0.data_mut()[0] = 1;
        drop(g0); // unpinned, dirty
        let (_p1, _g1) = pool.new_page().unwrap(); // pinned, clean
        let (_p2, mut g2) = pool.new_page().unwrap();
        g2.data_mut()[0] = 2;
        drop(g2); // unpinned, dirty

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 7);
        assert_eq!(stats.used_frames, 3);
        assert_eq!(stats.pinned_frames, 1);
        assert_eq!(stats.dirty_frames, 2);
    }

    #[test]
    fn test_pool_repeated_fetch_single_frame_identity() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, guard) = pool.new_page().unwrap();
        drop(guard);

        // Two concurrent pins resolve to the same frame.
        let g1 = pool.fetch_page(page_id).unwrap();
        let g2 = pool.fetch_page(page_id).unwrap();
        assert_eq!(pool.stats().used_frames, 1);
        assert_eq!(pool.frame(g1.frame_id).pin_count(), 2);
        drop(g1);
        drop(g2);
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_pool_guard_marks_dirty_on_data_mut() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, guard) = pool.new_page().unwrap();
        drop(guard);
        assert_eq!(pool.stats().dirty_frames, 0);

        let mut guard = pool.fetch_page(page_id).unwrap();
        guard.data_mut()[0] = 9;
        drop(guard);
        assert_eq!(pool.stats().dirty_frames, 1);
    }
}
