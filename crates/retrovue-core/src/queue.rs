// crates/retrovue-core/src/queue.rs
//
// StagingQueue: bounded single-producer/single-consumer ring of Frames.
// One Producer thread pushes, one Renderer thread pops — any second producer
// or consumer is a protocol violation (SPEC_FULL.md §5).
//
// Memory-ordering discipline (mirrors the Vyukov-style ring buffers in the
// retrieval pack, simplified to the SPSC case — no CAS loop is needed since
// there is only ever one writer of `tail` and one writer of `head`):
//   - push() writes the payload into the slot, then publishes with a Release
//     store to `tail`. pop() reads `tail` with Acquire, so the payload write
//     happens-before the payload read.
//   - pop() writes are symmetric on `head`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::frame::Frame;

struct Slot {
    // Only ever written by the producer while unoccupied, and read by the
    // consumer while occupied — never both at once, since size() gates both.
    cell: UnsafeCell<Option<Frame>>,
}

// SAFETY: access to `cell` is serialized by the head/tail protocol — the
// producer only touches slot[tail % cap] and the consumer only touches
// slot[head % cap], and the two never overlap because push requires
// `size < capacity` and pop requires `size > 0`.
unsafe impl Sync for Slot {}

/// Bounded SPSC ring buffer of frames.
pub struct StagingQueue {
    slots: Box<[Slot]>,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl StagingQueue {
    pub const DEFAULT_CAPACITY: usize = 60;

    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "StagingQueue capacity must be positive");
        let slots = (0..capacity)
            .map(|_| Slot {
                cell: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        StagingQueue {
            slots,
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate snapshot; consistent (never a partial read) but may be
    /// stale by the time the caller acts on it.
    pub fn size(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    /// Producer-only. Returns false (frame is returned to the caller
    /// untouched) iff the queue is full.
    pub fn push(&self, frame: Frame) -> Result<(), Frame> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity {
            return Err(frame);
        }
        let idx = tail % self.capacity;
        // SAFETY: only the producer writes this slot, and it is unoccupied
        // because size < capacity guarantees the consumer has already moved
        // head past any stale occupant at this index.
        unsafe {
            *self.slots[idx].cell.get() = Some(frame);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer-only. Returns None iff the queue is empty.
    pub fn pop(&self) -> Option<Frame> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = head % self.capacity;
        // SAFETY: only the consumer writes/reads this slot, and it is
        // occupied because head != tail guarantees the producer has
        // published a frame at this index.
        let frame = unsafe { (*self.slots[idx].cell.get()).take() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        frame
    }

    /// Non-destructive head inspection. Consumer-side only.
    pub fn peek(&self) -> Option<&Frame> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = head % self.capacity;
        unsafe { (*self.slots[idx].cell.get()).as_ref() }
    }

    /// Single-threaded use only — callers must guarantee no concurrent
    /// producer/consumer access while clearing.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{yuv420_len, FrameMeta};

    fn frame(pts: i64) -> Frame {
        Frame::new(
            2,
            2,
            vec![0u8; yuv420_len(2, 2)],
            FrameMeta {
                pts,
                dts: pts,
                duration: 1.0 / 30.0,
                asset_id: "a".into(),
            },
        )
    }

    /// S1 from SPEC_FULL.md §8.
    #[test]
    fn s1_spsc_fifo_scenario() {
        let q = StagingQueue::new(5);
        assert!(q.push(frame(0)).is_ok());
        assert!(q.push(frame(33_366)).is_ok());
        assert!(q.push(frame(66_732)).is_ok());

        assert_eq!(q.pop().unwrap().pts(), 0);

        assert!(q.push(frame(100_098)).is_ok());
        assert!(q.push(frame(133_464)).is_ok());
        assert_eq!(q.size(), 4);

        assert!(q.push(frame(166_830)).is_ok());
        assert_eq!(q.size(), 5);
        assert!(q.is_full());

        assert!(q.push(frame(200_196)).is_err());
        assert_eq!(q.size(), 5);

        let expect = [33_366, 66_732, 100_098, 133_464, 166_830];
        for pts in expect {
            assert_eq!(q.pop().unwrap().pts(), pts);
        }
        assert_eq!(q.size(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_on_empty_is_not_an_error() {
        let q = StagingQueue::new(2);
        assert!(q.pop().is_none());
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn push_pop_roundtrip_equality() {
        let q = StagingQueue::new(1);
        let f = frame(42);
        q.push(f.clone()).unwrap();
        let out = q.pop().unwrap();
        assert_eq!(out.pts(), f.pts());
        assert_eq!(out.dts(), f.dts());
        assert_eq!(out.width, f.width);
        assert_eq!(out.height, f.height);
        assert_eq!(out.data, f.data);
    }

    #[test]
    fn peek_does_not_remove() {
        let q = StagingQueue::new(2);
        q.push(frame(5)).unwrap();
        assert_eq!(q.peek().map(|f| f.pts()), Some(5));
        assert_eq!(q.size(), 1);
        assert_eq!(q.pop().map(|f| f.pts()), Some(5));
    }
}
