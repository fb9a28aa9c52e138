//! Cursors - the flow-control handles over a ring buffer.
//!
//! A cursor couples a published [`Sequence`] with a [`Barrier`] over the
//! upstream cursors it follows. Three flavours:
//!
//! - [`ReadCursor`]: one consumer draining positions the upstream published.
//! - [`WriteCursor`]: one producer, gated so it never laps its slowest
//!   follower.
//! - [`SharedWriteCursor`]: many producers; slots are claimed with an atomic
//!   counter and published strictly in claim order.
//!
//! All ranges are half-open: `begin()` is the next position the owner will
//! touch, `end()` is one past the last position currently allowed.

use std::sync::Arc;
use std::sync::atomic::{ AtomicI64, Ordering };

use crate::disruptor::barrier::Barrier;
use crate::disruptor::sequence::Sequence;
use crate::disruptor::wait_strategy::SpinWait;
use crate::error::{ Result, WeftError };

/// Anything that owns a published sequence another cursor can follow.
pub trait Cursored {
    fn sequence(&self) -> &Arc<Sequence>;
}

/// Consumer-side cursor: `[begin, end)` is the run of published positions
/// not yet processed by this consumer.
pub struct ReadCursor {
    name: &'static str,
    seq: Arc<Sequence>,
    barrier: Barrier,
    /// Cached exclusive end from the last barrier refresh.
    end_cache: AtomicI64,
}

impl ReadCursor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            seq: Arc::new(Sequence::default()),
            barrier: Barrier::new(),
            end_cache: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Gate this consumer on an upstream cursor.
    pub fn follows<C: Cursored>(&self, upstream: &C) {
        self.barrier.follows(upstream.sequence().clone());
    }

    /// Next position this consumer will process.
    #[inline]
    pub fn begin(&self) -> i64 {
        self.seq.relaxed() + 1
    }

    /// One past the last position known to be published.
    #[inline]
    pub fn end(&self) -> i64 {
        self.end_cache.load(Ordering::Relaxed)
    }

    /// Block until position `pos` is published; returns the refreshed
    /// exclusive end (always > `pos` on success).
    pub fn wait_for(&self, pos: i64) -> Result<i64> {
        let min = self.barrier.wait_for(pos)?;
        let end = min + 1;
        self.end_cache.store(end, Ordering::Relaxed);
        Ok(end)
    }

    /// Non-blocking refresh of `end()`.
    pub fn check_end(&self) -> i64 {
        let end = self.barrier.check() + 1;
        self.end_cache.store(end, Ordering::Relaxed);
        end
    }

    /// Mark every position up to and including `pos` as consumed, allowing
    /// producers that follow this cursor to reuse those slots. A repeat or
    /// backward publish is a programming error and panics.
    #[inline]
    pub fn publish(&self, pos: i64) {
        assert!(pos > self.seq.relaxed(), "publish must advance the cursor");
        self.seq.store_release(pos);
    }

    pub fn set_alert(&self, err: WeftError) {
        self.seq.set_alert(err);
    }

    pub fn is_alerted(&self) -> bool {
        self.seq.is_alerted()
    }

    pub fn check_alert(&self) -> Result<()> {
        self.seq.check_alert()
    }
}

impl Cursored for ReadCursor {
    fn sequence(&self) -> &Arc<Sequence> {
        &self.seq
    }
}

/// Single-producer cursor. The barrier tracks the cursors that consume this
/// producer's slots; `end()` stays `capacity` ahead of the slowest one.
pub struct WriteCursor {
    name: &'static str,
    seq: Arc<Sequence>,
    barrier: Barrier,
    capacity: i64,
    end_cache: AtomicI64,
}

impl WriteCursor {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of 2");
        Self {
            name,
            seq: Arc::new(Sequence::default()),
            barrier: Barrier::new(),
            capacity: capacity as i64,
            end_cache: AtomicI64::new(capacity as i64),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn follows<C: Cursored>(&self, downstream: &C) {
        self.barrier.follows(downstream.sequence().clone());
    }

    /// Next position this producer will write.
    #[inline]
    pub fn begin(&self) -> i64 {
        self.seq.relaxed() + 1
    }

    /// One past the last position writable without lapping a follower.
    #[inline]
    pub fn end(&self) -> i64 {
        self.end_cache.load(Ordering::Relaxed)
    }

    /// Block until position `pos` is writable, i.e. every follower has moved
    /// past `pos - capacity`; returns the refreshed exclusive end.
    pub fn wait_for(&self, pos: i64) -> Result<i64> {
        self.seq.check_alert()?;
        let min = self.barrier.wait_for(pos - self.capacity)?;
        let end = min + self.capacity + 1;
        self.end_cache.store(end, Ordering::Relaxed);
        Ok(end)
    }

    /// Release every position up to and including `pos` to consumers. A
    /// repeat or backward publish is a programming error and panics.
    #[inline]
    pub fn publish(&self, pos: i64) {
        assert!(pos > self.seq.relaxed(), "publish must advance the cursor");
        self.seq.store_release(pos);
    }

    /// Mark the stream finished: followers drain what was published, then
    /// see [`WeftError::Eof`].
    pub fn set_eof(&self) {
        self.seq.set_alert(WeftError::Eof);
    }

    pub fn set_alert(&self, err: WeftError) {
        self.seq.set_alert(err);
    }

    pub fn is_alerted(&self) -> bool {
        self.seq.is_alerted()
    }

    pub fn check_alert(&self) -> Result<()> {
        self.seq.check_alert()
    }
}

impl Cursored for WriteCursor {
    fn sequence(&self) -> &Arc<Sequence> {
        &self.seq
    }
}

/// Multi-producer cursor: writers race on a private claim counter, then
/// publish in claim order through the public sequence.
pub struct SharedWriteCursor {
    name: &'static str,
    /// Claim counter; strictly ahead of (or equal to) the public sequence.
    claim: Sequence,
    seq: Arc<Sequence>,
    barrier: Barrier,
    capacity: i64,
}

impl SharedWriteCursor {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of 2");
        Self {
            name,
            claim: Sequence::default(),
            seq: Arc::new(Sequence::default()),
            barrier: Barrier::new(),
            capacity: capacity as i64,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn follows<C: Cursored>(&self, downstream: &C) {
        self.barrier.follows(downstream.sequence().clone());
    }

    /// Next unpublished position.
    #[inline]
    pub fn begin(&self) -> i64 {
        self.seq.relaxed() + 1
    }

    /// Claim `n` consecutive positions; returns the first. The claimed range
    /// is `[first, first + n)`. Applies backpressure until the whole range
    /// fits within `capacity` of the slowest follower, and fails with the
    /// cursor's alert instead of waiting on a cancelled stream.
    pub fn claim(&self, n: i64) -> Result<i64> {
        assert!(n > 0, "claim of a non-positive range");
        self.seq.check_alert()?;

        let prev = self.claim.fetch_add(n);
        let first = prev + 1;
        let last = prev + n;

        let mut wait = SpinWait::new();
        loop {
            let min = self.barrier.check();
            if last <= min + self.capacity {
                break;
            }
            self.seq.check_alert()?;
            wait.snooze();
        }
        Ok(first)
    }

    /// Publish `slot`, waiting (tiered) until every earlier claim has
    /// published. This imposes a total publication order matching claim
    /// order across concurrent writers. Publishing a slot the public
    /// sequence has already passed is a programming error and panics.
    pub fn publish_after(&self, slot: i64, expected_prev: i64) -> Result<()> {
        assert!(expected_prev < slot, "publish_after must advance the cursor");

        let mut wait = SpinWait::new();
        loop {
            let cur = self.seq.acquire();
            if cur == expected_prev {
                break;
            }
            if self.seq.is_alerted() {
                return self.seq.check_alert();
            }
            assert!(cur < slot, "slot already published past");
            wait.snooze();
        }
        self.seq.store_release(slot);
        Ok(())
    }

    /// Last claimed position (diagnostics and tests).
    pub fn claimed(&self) -> i64 {
        self.claim.relaxed()
    }

    pub fn set_alert(&self, err: WeftError) {
        self.seq.set_alert(err);
    }

    pub fn is_alerted(&self) -> bool {
        self.seq.is_alerted()
    }

    pub fn check_alert(&self) -> Result<()> {
        self.seq.check_alert()
    }
}

impl Cursored for SharedWriteCursor {
    fn sequence(&self) -> &Arc<Sequence> {
        &self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spsc_pair(capacity: usize) -> (WriteCursor, ReadCursor) {
        let writer = WriteCursor::new("writer", capacity);
        let reader = ReadCursor::new("reader");
        reader.follows(&writer);
        writer.follows(&reader);
        (writer, reader)
    }

    #[test]
    fn test_initial_ranges() {
        let (writer, reader) = spsc_pair(8);
        assert_eq!(writer.begin(), 0);
        assert_eq!(writer.end(), 8);
        assert_eq!(reader.begin(), 0);
        assert_eq!(reader.end(), 0);
    }

    #[test]
    fn test_reader_sees_published_run() {
        let (writer, reader) = spsc_pair(8);
        writer.publish(3);
        let end = reader.wait_for(0).unwrap();
        assert_eq!(end, 4);
        assert_eq!(reader.end(), 4);
    }

    #[test]
    fn test_writer_end_tracks_slowest_reader() {
        let (writer, reader) = spsc_pair(8);
        writer.publish(7); // ring full, reader still at -1
        reader.publish(2);
        let end = writer.wait_for(8).unwrap();
        assert_eq!(end, 2 + 8 + 1);
        assert_eq!(writer.end(), 11);
    }

    #[test]
    fn test_shared_claims_are_disjoint() {
        let writer = SharedWriteCursor::new("shared", 8);
        let reader = ReadCursor::new("reader");
        reader.follows(&writer);
        writer.follows(&reader);

        let a = writer.claim(1).unwrap();
        let b = writer.claim(2).unwrap();
        let c = writer.claim(1).unwrap();
        assert_eq!((a, b, c), (0, 1, 3));
        assert_eq!(writer.claimed(), 3);
    }

    #[test]
    fn test_publish_after_preserves_claim_order() {
        let writer = SharedWriteCursor::new("shared", 8);
        let reader = ReadCursor::new("reader");
        reader.follows(&writer);
        writer.follows(&reader);

        let first = writer.claim(1).unwrap();
        let second = writer.claim(1).unwrap();

        // Publish out of claim order from another thread; the second slot
        // must not become visible before the first.
        let w = std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                writer.publish_after(second, second - 1).unwrap();
                writer.begin()
            });
            std::thread::sleep(std::time::Duration::from_millis(5));
            assert_eq!(writer.begin(), 0, "slot 1 published before slot 0");
            writer.publish_after(first, first - 1).unwrap();
            handle.join().unwrap()
        });
        assert_eq!(w, 2);
    }

    #[test]
    #[should_panic(expected = "must advance the cursor")]
    fn test_reader_double_publish_panics() {
        let (writer, reader) = spsc_pair(8);
        writer.publish(3);
        reader.publish(2);
        reader.publish(2);
    }

    #[test]
    #[should_panic(expected = "must advance the cursor")]
    fn test_writer_backward_publish_panics() {
        let (writer, _reader) = spsc_pair(8);
        writer.publish(5);
        writer.publish(4);
    }

    #[test]
    fn test_claim_fails_after_alert() {
        let writer = SharedWriteCursor::new("shared", 8);
        let reader = ReadCursor::new("reader");
        reader.follows(&writer);
        writer.follows(&reader);

        writer.set_alert(WeftError::Cancelled);
        assert_eq!(writer.claim(1), Err(WeftError::Cancelled));
    }

    #[test]
    fn test_eof_drains_then_raises() {
        let (writer, reader) = spsc_pair(8);
        writer.publish(4);
        writer.set_eof();

        // Everything published before the mark is served...
        let end = reader.wait_for(0).unwrap();
        assert_eq!(end, 5);
        // ...and the next refresh past it raises EOF.
        assert_eq!(reader.wait_for(5), Err(WeftError::Eof));
    }
}
