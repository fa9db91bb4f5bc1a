//! The buffer manager.

use crate::frame::{Frame, FrameId};
use crate::replacer::ClockReplacer;
use log::debug;
use marten_common::page::{PageId, PageNo, PAGE_SIZE};
use marten_common::{MartenError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use sysinfo::System;

/// Backing store for one paged file, as seen by the buffer manager.
///
/// The storage crate implements this for its paged files; the manager uses
/// it to fault pages in, write dirty pages back (on flush and on eviction)
/// and extend the file when a new page is allocated.
pub trait PageStore: Send + Sync {
    /// Process-unique identifier of the open file.
    fn file_id(&self) -> u32;

    /// Reads page `page_no` into `buf`.
    fn read_page(&self, page_no: PageNo, buf: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Writes `buf` to page `page_no`.
    fn write_page(&self, page_no: PageNo, buf: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Appends a zeroed page to the file and returns its page number.
    fn allocate_page(&self) -> Result<PageNo>;
}

/// Configuration for the buffer manager.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// Buffer manager.
///
/// Owns a fixed array of page frames and hands out pinned access to pages
/// of registered files. Every `read_page`/`alloc_page` pins; every pin must
/// be matched by exactly one `unpin_page`, with `dirty = true` when the
/// page bytes changed. Unpinned frames are reclaimed by clock replacement;
/// dirty victims are written back through the owning file first.
pub struct BufferManager {
    config: BufferConfig,
    frames: Vec<Frame>,
    /// Resident pages.
    page_table: Mutex<HashMap<PageId, FrameId>>,
    /// Frames holding no page.
    free_list: Mutex<Vec<FrameId>>,
    /// Replacement policy over occupied, unpinned frames.
    replacer: ClockReplacer,
    /// Open files, for eviction write-back.
    files: Mutex<HashMap<u32, Arc<dyn PageStore>>>,
}

impl BufferManager {
    /// Creates a buffer manager with the given configuration.
    pub fn new(config: BufferConfig) -> Self {
        let num_frames = config.num_frames;
        let frames: Vec<_> = (0..num_frames).map(|_| Frame::new()).collect();
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: Mutex::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a buffer manager sized to 25% of available system RAM,
    /// with a floor of 256 frames.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let num_frames = (available_bytes / 4 / PAGE_SIZE).max(256);

        Self::new(BufferConfig { num_frames })
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Registers a file so evicted dirty pages can be written back to it.
    pub fn register_file(&self, file: Arc<dyn PageStore>) {
        self.files.lock().insert(file.file_id(), file);
    }

    /// Removes a file from the registry.
    pub fn unregister_file(&self, file_id: u32) {
        self.files.lock().remove(&file_id);
    }

    #[inline]
    fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id.0 as usize]
    }

    /// Pins a frame that already holds its page.
    fn pin_resident(&self, frame_id: FrameId) {
        let frame = self.frame(frame_id);
        if frame.pin() == 1 {
            self.replacer.set_evictable(frame_id, false);
        }
        self.replacer.record_access(frame_id);
    }

    /// Obtains an empty frame, evicting if the free list is exhausted.
    ///
    /// The returned frame is zeroed, unpinned, not in the page table and
    /// not known to the replacer.
    fn allocate_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        let victim_id = self.replacer.evict().ok_or(MartenError::BufferPoolFull)?;
        let frame = self.frame(victim_id);

        if let Some(victim_pid) = frame.page_id() {
            if frame.is_dirty() {
                let store = self.files.lock().get(&victim_pid.file_id).cloned();
                let written = match store {
                    Some(store) => store.write_page(victim_pid.page_no, &frame.read_data()),
                    None => Err(MartenError::FileNotRegistered(victim_pid.file_id)),
                };
                if let Err(e) = written {
                    // Write-back failed: the victim stays resident.
                    self.replacer.set_evictable(victim_id, true);
                    return Err(e);
                }
            }
            self.page_table.lock().remove(&victim_pid);
        }

        frame.reset();
        Ok(victim_id)
    }

    /// Returns a frame to the free list after a failed load.
    fn release_frame(&self, frame_id: FrameId) {
        self.frame(frame_id).reset();
        self.free_list.lock().push(frame_id);
    }

    /// Reads a page of `file` into the pool and pins it.
    pub fn read_page(&self, file: &dyn PageStore, page_no: PageNo) -> Result<()> {
        let pid = PageId::new(file.file_id(), page_no);

        if let Some(&frame_id) = self.page_table.lock().get(&pid) {
            self.pin_resident(frame_id);
            return Ok(());
        }

        let frame_id = self.allocate_frame()?;
        let frame = self.frame(frame_id);

        let mut buf = frame.write_data();
        let read_result = file.read_page(page_no, &mut buf);
        drop(buf);
        if let Err(e) = read_result {
            self.release_frame(frame_id);
            return Err(e);
        }

        frame.set_page_id(Some(pid));
        frame.pin();
        self.replacer.record_access(frame_id);
        self.page_table.lock().insert(pid, frame_id);
        Ok(())
    }

    /// Allocates a new page in `file` and pins a zeroed frame for it.
    ///
    /// Returns the new page number. The on-disk page is zeroed; the frame
    /// is only written back if the caller unpins with `dirty = true`.
    pub fn alloc_page(&self, file: &dyn PageStore) -> Result<PageNo> {
        let page_no = file.allocate_page()?;
        let pid = PageId::new(file.file_id(), page_no);

        let frame_id = self.allocate_frame()?;
        let frame = self.frame(frame_id);
        frame.set_page_id(Some(pid));
        frame.pin();
        self.replacer.record_access(frame_id);
        self.page_table.lock().insert(pid, frame_id);
        Ok(page_no)
    }

    /// Releases one pin on a page, marking it dirty if its bytes changed.
    pub fn unpin_page(&self, file_id: u32, page_no: PageNo, dirty: bool) -> Result<()> {
        let pid = PageId::new(file_id, page_no);
        let frame_id = *self
            .page_table
            .lock()
            .get(&pid)
            .ok_or(MartenError::PageNotPinned { file_id, page_no })?;

        let frame = self.frame(frame_id);
        if frame.pin_count() == 0 {
            return Err(MartenError::PageNotPinned { file_id, page_no });
        }
        if dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        Ok(())
    }

    /// Runs `f` over the bytes of a pinned page.
    pub fn with_page<R>(
        &self,
        file_id: u32,
        page_no: PageNo,
        f: impl FnOnce(&[u8; PAGE_SIZE]) -> R,
    ) -> Result<R> {
        let frame = self.pinned_frame(file_id, page_no)?;
        let data = frame.read_data();
        Ok(f(&data))
    }

    /// Runs `f` over the mutable bytes of a pinned page.
    ///
    /// Mutating does not mark the page dirty; pass `dirty = true` to the
    /// matching `unpin_page` call instead.
    pub fn with_page_mut<R>(
        &self,
        file_id: u32,
        page_no: PageNo,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Result<R> {
        let frame = self.pinned_frame(file_id, page_no)?;
        let mut data = frame.write_data();
        Ok(f(&mut data))
    }

    fn pinned_frame(&self, file_id: u32, page_no: PageNo) -> Result<&Frame> {
        let pid = PageId::new(file_id, page_no);
        let frame_id = *self
            .page_table
            .lock()
            .get(&pid)
            .ok_or(MartenError::PageNotPinned { file_id, page_no })?;
        let frame = self.frame(frame_id);
        if frame.pin_count() == 0 {
            return Err(MartenError::PageNotPinned { file_id, page_no });
        }
        Ok(frame)
    }

    /// Writes every dirty resident page of `file` back to disk.
    ///
    /// Returns the number of pages written.
    pub fn flush_file(&self, file: &dyn PageStore) -> Result<usize> {
        let file_id = file.file_id();
        let resident: Vec<(PageId, FrameId)> = self
            .page_table
            .lock()
            .iter()
            .filter(|(pid, _)| pid.file_id == file_id)
            .map(|(&pid, &fid)| (pid, fid))
            .collect();

        let mut flushed = 0;
        for (pid, frame_id) in resident {
            let frame = self.frame(frame_id);
            if frame.is_dirty() {
                file.write_page(pid.page_no, &frame.read_data())?;
                frame.set_dirty(false);
                flushed += 1;
            }
        }
        debug!("flushed {} pages of file {}", flushed, file_id);
        Ok(flushed)
    }

    /// Flushes `file` and drops all of its unpinned frames from the pool.
    ///
    /// Used when a file is closed; pages of a closed file must not linger
    /// where a later eviction would try to write them back.
    pub fn evict_file(&self, file: &dyn PageStore) -> Result<()> {
        self.flush_file(file)?;

        let file_id = file.file_id();
        let resident: Vec<(PageId, FrameId)> = self
            .page_table
            .lock()
            .iter()
            .filter(|(pid, _)| pid.file_id == file_id)
            .map(|(&pid, &fid)| (pid, fid))
            .collect();

        for (pid, frame_id) in resident {
            let frame = self.frame(frame_id);
            if frame.is_pinned() {
                continue;
            }
            self.page_table.lock().remove(&pid);
            self.replacer.remove(frame_id);
            frame.reset();
            self.free_list.lock().push(frame_id);
        }
        Ok(())
    }

    /// Number of resident pages of `file_id` holding at least one pin.
    pub fn pinned_page_count(&self, file_id: u32) -> usize {
        let table = self.page_table.lock();
        table
            .iter()
            .filter(|(pid, fid)| pid.file_id == file_id && self.frame(**fid).is_pinned())
            .count()
    }

    /// Returns pool-wide statistics.
    pub fn stats(&self) -> BufferStats {
        let table = self.page_table.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        for &fid in table.values() {
            let frame = self.frame(fid);
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }
        BufferStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: table.len(),
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Frames holding no page.
    pub free_frames: usize,
    /// Frames holding a page.
    pub used_frames: usize,
    /// Frames with at least one pin.
    pub pinned_frames: usize,
    /// Frames whose bytes diverge from disk.
    pub dirty_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory page store for exercising the manager without a real file.
    struct MemStore {
        file_id: u32,
        pages: Mutex<Vec<Box<[u8; PAGE_SIZE]>>>,
        writes: AtomicU32,
    }

    impl MemStore {
        fn new(file_id: u32) -> Arc<Self> {
            Arc::new(Self {
                file_id,
                // Page 0 stands in for the file header.
                pages: Mutex::new(vec![Box::new([0u8; PAGE_SIZE])]),
                writes: AtomicU32::new(0),
            })
        }

        fn write_count(&self) -> u32 {
            self.writes.load(Ordering::Relaxed)
        }

        fn page_byte(&self, page_no: PageNo, offset: usize) -> u8 {
            self.pages.lock()[page_no as usize][offset]
        }
    }

    impl PageStore for MemStore {
        fn file_id(&self) -> u32 {
            self.file_id
        }

        fn read_page(&self, page_no: PageNo, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
            let pages = self.pages.lock();
            let page = pages
                .get(page_no as usize)
                .ok_or(MartenError::PageNotFound {
                    file_id: self.file_id,
                    page_no,
                })?;
            buf.copy_from_slice(&**page);
            Ok(())
        }

        fn write_page(&self, page_no: PageNo, buf: &[u8; PAGE_SIZE]) -> Result<()> {
            let mut pages = self.pages.lock();
            let page = pages
                .get_mut(page_no as usize)
                .ok_or(MartenError::PageNotFound {
                    file_id: self.file_id,
                    page_no,
                })?;
            page.copy_from_slice(buf);
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn allocate_page(&self) -> Result<PageNo> {
            let mut pages = self.pages.lock();
            pages.push(Box::new([0u8; PAGE_SIZE]));
            Ok((pages.len() - 1) as PageNo)
        }
    }

    fn manager_with_store(num_frames: usize) -> (BufferManager, Arc<MemStore>) {
        let manager = BufferManager::new(BufferConfig { num_frames });
        let store = MemStore::new(7);
        manager.register_file(store.clone());
        (manager, store)
    }

    #[test]
    fn test_manager_new() {
        let manager = BufferManager::new(BufferConfig { num_frames: 10 });
        assert_eq!(manager.num_frames(), 10);
        assert_eq!(manager.free_count(), 10);
    }

    #[test]
    fn test_alloc_pin_unpin_cycle() {
        let (manager, store) = manager_with_store(4);

        let page_no = manager.alloc_page(store.as_ref()).unwrap();
        assert_eq!(page_no, 1);
        assert_eq!(manager.pinned_page_count(7), 1);

        manager
            .with_page_mut(7, page_no, |data| data[0] = 0xAB)
            .unwrap();
        manager.unpin_page(7, page_no, true).unwrap();
        assert_eq!(manager.pinned_page_count(7), 0);

        // Still resident and readable after re-pinning.
        manager.read_page(store.as_ref(), page_no).unwrap();
        let byte = manager.with_page(7, page_no, |data| data[0]).unwrap();
        assert_eq!(byte, 0xAB);
        manager.unpin_page(7, page_no, false).unwrap();
    }

    #[test]
    fn test_read_page_faults_from_store() {
        let (manager, store) = manager_with_store(4);

        let page_no = store.allocate_page().unwrap();
        store.pages.lock()[page_no as usize][10] = 0x5A;

        manager.read_page(store.as_ref(), page_no).unwrap();
        let byte = manager.with_page(7, page_no, |data| data[10]).unwrap();
        assert_eq!(byte, 0x5A);
        manager.unpin_page(7, page_no, false).unwrap();
    }

    #[test]
    fn test_read_missing_page_fails_and_releases_frame() {
        let (manager, store) = manager_with_store(4);

        let result = manager.read_page(store.as_ref(), 99);
        assert!(matches!(result, Err(MartenError::PageNotFound { .. })));
        assert_eq!(manager.free_count(), 4);
    }

    #[test]
    fn test_unpin_unknown_page_fails() {
        let (manager, _store) = manager_with_store(4);
        let result = manager.unpin_page(7, 1, false);
        assert!(matches!(result, Err(MartenError::PageNotPinned { .. })));
    }

    #[test]
    fn test_unpin_balance_enforced() {
        let (manager, store) = manager_with_store(4);

        let page_no = manager.alloc_page(store.as_ref()).unwrap();
        manager.unpin_page(7, page_no, false).unwrap();

        // Second unpin without a matching pin is an error.
        let result = manager.unpin_page(7, page_no, false);
        assert!(matches!(result, Err(MartenError::PageNotPinned { .. })));
    }

    #[test]
    fn test_with_page_requires_pin() {
        let (manager, store) = manager_with_store(4);

        let page_no = manager.alloc_page(store.as_ref()).unwrap();
        manager.unpin_page(7, page_no, false).unwrap();

        let result = manager.with_page(7, page_no, |_| ());
        assert!(matches!(result, Err(MartenError::PageNotPinned { .. })));
    }

    #[test]
    fn test_nested_pins() {
        let (manager, store) = manager_with_store(4);

        let page_no = manager.alloc_page(store.as_ref()).unwrap();
        manager.read_page(store.as_ref(), page_no).unwrap();
        assert_eq!(manager.pinned_page_count(7), 1);

        manager.unpin_page(7, page_no, false).unwrap();
        assert_eq!(manager.pinned_page_count(7), 1);
        manager.unpin_page(7, page_no, false).unwrap();
        assert_eq!(manager.pinned_page_count(7), 0);
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let (manager, store) = manager_with_store(2);

        // Fill both frames with dirty pages, then unpin them.
        let p1 = manager.alloc_page(store.as_ref()).unwrap();
        manager.with_page_mut(7, p1, |data| data[0] = 1).unwrap();
        manager.unpin_page(7, p1, true).unwrap();

        let p2 = manager.alloc_page(store.as_ref()).unwrap();
        manager.with_page_mut(7, p2, |data| data[0] = 2).unwrap();
        manager.unpin_page(7, p2, true).unwrap();

        // A third page forces an eviction with write-back.
        let p3 = manager.alloc_page(store.as_ref()).unwrap();
        manager.unpin_page(7, p3, false).unwrap();

        assert_eq!(store.write_count(), 1);

        // Whatever was evicted is still readable with its data intact.
        manager.read_page(store.as_ref(), p1).unwrap();
        let byte = manager.with_page(7, p1, |data| data[0]).unwrap();
        assert_eq!(byte, 1);
        manager.unpin_page(7, p1, false).unwrap();
    }

    #[test]
    fn test_pool_full_when_all_pinned() {
        let (manager, store) = manager_with_store(2);

        manager.alloc_page(store.as_ref()).unwrap();
        manager.alloc_page(store.as_ref()).unwrap();

        let result = manager.alloc_page(store.as_ref());
        assert!(matches!(result, Err(MartenError::BufferPoolFull)));
    }

    #[test]
    fn test_flush_file() {
        let (manager, store) = manager_with_store(4);

        let p1 = manager.alloc_page(store.as_ref()).unwrap();
        manager.with_page_mut(7, p1, |data| data[0] = 0xEE).unwrap();
        manager.unpin_page(7, p1, true).unwrap();

        assert_eq!(store.page_byte(p1, 0), 0);
        let flushed = manager.flush_file(store.as_ref()).unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(store.page_byte(p1, 0), 0xEE);

        // Second flush has nothing to do.
        assert_eq!(manager.flush_file(store.as_ref()).unwrap(), 0);
    }

    #[test]
    fn test_evict_file_drops_frames() {
        let (manager, store) = manager_with_store(4);

        let p1 = manager.alloc_page(store.as_ref()).unwrap();
        manager.with_page_mut(7, p1, |data| data[0] = 9).unwrap();
        manager.unpin_page(7, p1, true).unwrap();

        manager.evict_file(store.as_ref()).unwrap();
        assert_eq!(manager.free_count(), 4);
        assert_eq!(store.page_byte(p1, 0), 9);
        assert_eq!(manager.stats().used_frames, 0);
    }

    #[test]
    fn test_stats() {
        let (manager, store) = manager_with_store(4);

        let p1 = manager.alloc_page(store.as_ref()).unwrap();
        let p2 = manager.alloc_page(store.as_ref()).unwrap();
        manager.with_page_mut(7, p2, |data| data[0] = 1).unwrap();
        manager.unpin_page(7, p2, true).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total_frames, 4);
        assert_eq!(stats.free_frames, 2);
        assert_eq!(stats.used_frames, 2);
        assert_eq!(stats.pinned_frames, 1);
        assert_eq!(stats.dirty_frames, 1);

        manager.unpin_page(7, p1, false).unwrap();
    }

    #[test]
    fn test_two_files_share_the_pool() {
        let manager = BufferManager::new(BufferConfig { num_frames: 4 });
        let a = MemStore::new(1);
        let b = MemStore::new(2);
        manager.register_file(a.clone());
        manager.register_file(b.clone());

        let pa = manager.alloc_page(a.as_ref()).unwrap();
        let pb = manager.alloc_page(b.as_ref()).unwrap();
        manager.with_page_mut(1, pa, |data| data[0] = 0xA1).unwrap();
        manager.with_page_mut(2, pb, |data| data[0] = 0xB2).unwrap();
        manager.unpin_page(1, pa, true).unwrap();
        manager.unpin_page(2, pb, true).unwrap();

        manager.flush_file(a.as_ref()).unwrap();
        manager.flush_file(b.as_ref()).unwrap();
        assert_eq!(a.page_byte(pa, 0), 0xA1);
        assert_eq!(b.page_byte(pb, 0), 0xB2);
    }
}
