//! Buffer frames: the fixed-size slots pages live in while pinned.

use marten_common::page::{PageId, PAGE_SIZE};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Sentinel for "no page loaded".
const NO_PAGE: u64 = u64::MAX;

/// Index of a frame within the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A single buffer frame: one page worth of bytes plus the bookkeeping the
/// manager needs (which page is resident, how many pins it holds, whether
/// its bytes diverge from disk).
pub struct Frame {
    /// Resident page, packed as u64 (`NO_PAGE` = empty).
    page_id: AtomicU64,
    /// Number of outstanding pins.
    pin_count: AtomicU32,
    /// True when the frame's bytes have not been written back.
    dirty: AtomicBool,
    /// The page bytes.
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl Frame {
    /// Creates an empty frame.
    pub fn new() -> Self {
        Self {
            page_id: AtomicU64::new(NO_PAGE),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    /// Returns the resident page, if any.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let packed = self.page_id.load(Ordering::Acquire);
        if packed == NO_PAGE {
            None
        } else {
            Some(PageId::from_u64(packed))
        }
    }

    /// Sets (or clears) the resident page.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<PageId>) {
        let packed = page_id.map(|p| p.as_u64()).unwrap_or(NO_PAGE);
        self.page_id.store(packed, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count, returning the new count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count, returning the new count. Saturates at 0.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if any pin is outstanding.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns the dirty flag.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sets the dirty flag.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Read access to the page bytes.
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Write access to the page bytes.
    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Overwrites the frame bytes from `src`.
    #[inline]
    pub fn load_from(&self, src: &[u8; PAGE_SIZE]) {
        self.data.write().copy_from_slice(src);
    }

    /// Zeroes the frame bytes.
    #[inline]
    pub fn zero_data(&self) {
        self.data.write().fill(0);
    }

    /// Returns the frame to its empty state.
    pub fn reset(&self) {
        self.page_id.store(NO_PAGE, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.zero_data();
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new() {
        let frame = Frame::new();
        assert!(frame.page_id().is_none());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_frame_pin_unpin() {
        let frame = Frame::new();

        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert!(frame.is_pinned());

        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_frame_unpin_saturates_at_zero() {
        let frame = Frame::new();
        assert_eq!(frame.unpin(), 0);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_frame_page_id() {
        let frame = Frame::new();
        let page_id = PageId::new(1, 100);

        frame.set_page_id(Some(page_id));
        assert_eq!(frame.page_id(), Some(page_id));

        frame.set_page_id(None);
        assert!(frame.page_id().is_none());
    }

    #[test]
    fn test_frame_dirty() {
        let frame = Frame::new();

        frame.set_dirty(true);
        assert!(frame.is_dirty());

        frame.set_dirty(false);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_frame_data_access() {
        let frame = Frame::new();

        {
            let mut data = frame.write_data();
            data[0] = 0xAB;
            data[PAGE_SIZE - 1] = 0xCD;
        }

        let data = frame.read_data();
        assert_eq!(data[0], 0xAB);
        assert_eq!(data[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_frame_load_and_zero() {
        let frame = Frame::new();
        let mut src = [0u8; PAGE_SIZE];
        src[7] = 7;

        frame.load_from(&src);
        assert_eq!(frame.read_data()[7], 7);

        frame.zero_data();
        assert_eq!(frame.read_data()[7], 0);
    }

    #[test]
    fn test_frame_reset() {
        let frame = Frame::new();
        frame.set_page_id(Some(PageId::new(1, 1)));
        frame.pin();
        frame.set_dirty(true);
        frame.write_data()[0] = 0xFF;

        frame.reset();

        assert!(frame.page_id().is_none());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert_eq!(frame.read_data()[0], 0);
    }

    #[test]
    fn test_frame_id_display() {
        assert_eq!(FrameId(42).to_string(), "frame:42");
    }
}
