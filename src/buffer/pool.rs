//! Fixed-capacity segment allocator with a free list.

use std::sync::Mutex;

use bytes::BytesMut;

/// A contiguous byte buffer of fixed capacity, the unit of transport I/O.
///
/// Segments have exactly one owner at any instant: the pool while idle, a
/// writer while being filled, the transport send path while draining. Move
/// semantics enforce the single-owner rule.
#[derive(Debug)]
pub struct Segment {
    buf: BytesMut,
}

impl Segment {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Committed bytes in the segment.
    #[must_use]
    pub fn len(&self) -> usize { self.buf.len() }

    /// True when no bytes have been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    /// Borrow the committed bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] { &self.buf }

    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut { &mut self.buf }

    /// Placeholder segment used when moving a real one out of a writer.
    pub(crate) fn detached() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    fn reset(&mut self) { self.buf.clear(); }
}

/// Thread-safe pool of reusable [`Segment`]s.
///
/// The pool never shrinks below demand; the number of idle segments it
/// retains is capped so a burst does not pin memory forever.
#[derive(Debug)]
pub struct SegmentPool {
    segment_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Segment>>,
}

impl SegmentPool {
    /// Create a pool handing out segments of `segment_size` bytes, keeping at
    /// most `max_idle` idle segments around.
    #[must_use]
    pub fn new(segment_size: usize, max_idle: usize) -> Self {
        Self {
            segment_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Capacity of the segments this pool hands out.
    #[must_use]
    pub fn segment_size(&self) -> usize { self.segment_size }

    /// Take a segment from the free list, allocating if none is idle.
    #[must_use]
    pub fn acquire(&self) -> Segment {
        let recycled = self.idle.lock().expect("segment pool poisoned").pop();
        recycled.unwrap_or_else(|| Segment::with_capacity(self.segment_size))
    }

    /// Return a segment to the free list; dropped if the list is full.
    pub fn release(&self, mut segment: Segment) {
        segment.reset();
        let mut idle = self.idle.lock().expect("segment pool poisoned");
        if idle.len() < self.max_idle {
            idle.push(segment);
        }
    }

    /// Number of idle segments currently retained.
    #[must_use]
    pub fn idle_count(&self) -> usize { self.idle.lock().expect("segment pool poisoned").len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_segments() {
        let pool = SegmentPool::new(1024, 4);
        let mut seg = pool.acquire();
        seg.buf_mut().extend_from_slice(b"abc");
        pool.release(seg);
        assert_eq!(pool.idle_count(), 1);

        let seg = pool.acquire();
        assert!(seg.is_empty(), "recycled segment must be reset");
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn idle_list_is_capped() {
        let pool = SegmentPool::new(64, 2);
        let segments: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for seg in segments {
            pool.release(seg);
        }
        assert_eq!(pool.idle_count(), 2);
    }
}
