//! Clock (second-chance) page replacement.

use crate::frame::FrameId;
use parking_lot::Mutex;

/// Clock replacement over the pool's frames.
///
/// The manager marks a frame evictable when its pin count drops to zero and
/// non-evictable when it is pinned again; `record_access` grants a frame a
/// second chance on the next sweep.
pub struct ClockReplacer {
    num_frames: usize,
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    /// Per-frame: (evictable, reference bit).
    slots: Vec<(bool, bool)>,
    /// Current clock hand position.
    hand: usize,
    /// Number of evictable frames.
    evictable: usize,
}

impl ClockReplacer {
    /// Creates a replacer for `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            inner: Mutex::new(ClockInner {
                slots: vec![(false, false); num_frames],
                hand: 0,
                evictable: 0,
            }),
        }
    }

    /// Sets the reference bit for a frame.
    pub fn record_access(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.inner.lock().slots[idx].1 = true;
        }
    }

    /// Marks a frame evictable or not.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let idx = frame_id.0 as usize;
        if idx >= self.num_frames {
            return;
        }
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[idx];
        if slot.0 != evictable {
            slot.0 = evictable;
            if evictable {
                inner.evictable += 1;
            } else {
                inner.evictable -= 1;
            }
        }
    }

    /// Selects and claims a victim frame, or None if nothing is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.evictable == 0 {
            return None;
        }

        // Two sweeps suffice: the first clears reference bits, the second
        // must find a victim among the evictable frames.
        for _ in 0..(2 * self.num_frames) {
            let hand = inner.hand;
            inner.hand = (hand + 1) % self.num_frames;

            let slot = &mut inner.slots[hand];
            if !slot.0 {
                continue;
            }
            if slot.1 {
                slot.1 = false;
                continue;
            }
            slot.0 = false;
            inner.evictable -= 1;
            return Some(FrameId(hand as u32));
        }
        None
    }

    /// Forgets a frame entirely (freed back to the free list).
    pub fn remove(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx >= self.num_frames {
            return;
        }
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[idx];
        if slot.0 {
            inner.evictable -= 1;
        }
        inner.slots[idx] = (false, false);
    }

    /// Number of currently evictable frames.
    pub fn evictable_count(&self) -> usize {
        self.inner.lock().evictable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replacer_new() {
        let replacer = ClockReplacer::new(10);
        assert_eq!(replacer.evictable_count(), 0);
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_replacer_set_evictable() {
        let replacer = ClockReplacer::new(10);

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.evictable_count(), 2);

        // Idempotent
        replacer.set_evictable(FrameId(0), true);
        assert_eq!(replacer.evictable_count(), 2);

        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.evictable_count(), 1);
    }

    #[test]
    fn test_replacer_evict_single() {
        let replacer = ClockReplacer::new(10);
        replacer.set_evictable(FrameId(5), true);

        assert_eq!(replacer.evict(), Some(FrameId(5)));
        assert_eq!(replacer.evictable_count(), 0);
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_replacer_second_chance() {
        let replacer = ClockReplacer::new(3);
        for i in 0..3 {
            replacer.set_evictable(FrameId(i), true);
        }

        // Frames 0 and 1 get a second chance; frame 2 goes first.
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));

        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }

    #[test]
    fn test_replacer_evict_all_referenced() {
        let replacer = ClockReplacer::new(3);
        for i in 0..3 {
            replacer.set_evictable(FrameId(i), true);
            replacer.record_access(FrameId(i));
        }

        // First sweep clears the bits, second finds a victim.
        assert!(replacer.evict().is_some());
        assert_eq!(replacer.evictable_count(), 2);
    }

    #[test]
    fn test_replacer_remove() {
        let replacer = ClockReplacer::new(10);
        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        replacer.remove(FrameId(0));
        assert_eq!(replacer.evictable_count(), 1);
        assert_eq!(replacer.evict(), Some(FrameId(1)));
    }

    #[test]
    fn test_replacer_skips_pinned() {
        let replacer = ClockReplacer::new(3);
        for i in 0..3 {
            replacer.set_evictable(FrameId(i), true);
        }
        replacer.set_evictable(FrameId(1), false);

        let v1 = replacer.evict().unwrap();
        let v2 = replacer.evict().unwrap();
        assert_ne!(v1, FrameId(1));
        assert_ne!(v2, FrameId(1));
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_replacer_out_of_bounds() {
        let replacer = ClockReplacer::new(5);

        // None of these panic or corrupt the count.
        replacer.set_evictable(FrameId(100), true);
        replacer.record_access(FrameId(100));
        replacer.remove(FrameId(100));

        assert_eq!(replacer.evictable_count(), 0);
    }
}
