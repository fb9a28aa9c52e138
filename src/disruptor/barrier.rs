//! Barrier - gates a cursor on the minimum of its upstream sequences.
//!
//! A cursor that "follows" other cursors owns a barrier over their
//! sequences. `wait_for(pos)` blocks (tiered spin, yield, sleep) until every
//! upstream has reached `pos`, and propagates upstream alerts with the drain
//! rule: an alerted upstream that is already past `pos` contributes its last
//! published position and the consumer keeps running until it has caught up,
//! at which point the alert is raised.

use std::sync::Arc;
use std::sync::atomic::{ AtomicI64, Ordering };

use parking_lot::RwLock;

use crate::disruptor::sequence::{ Sequence, INITIAL_SEQUENCE };
use crate::disruptor::wait_strategy::SpinWait;
use crate::error::{ Result, WeftError };

pub struct Barrier {
    upstream: RwLock<Vec<Arc<Sequence>>>,
    /// Cached minimum from the last successful wait; positions at or below
    /// it are served without touching the upstream cache lines.
    last_min: AtomicI64,
}

impl Barrier {
    pub fn new() -> Self {
        Self {
            upstream: RwLock::new(Vec::new()),
            last_min: AtomicI64::new(INITIAL_SEQUENCE),
        }
    }

    /// Append an upstream sequence. Wiring happens at setup time, before the
    /// pipeline starts moving; the lock is never contended on the hot path.
    pub fn follows(&self, seq: Arc<Sequence>) {
        self.upstream.write().push(seq);
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.read().is_empty()
    }

    /// Block until every upstream sequence has reached `pos`; return their
    /// minimum (always >= `pos` on success).
    ///
    /// Published data always wins over an alert: an upstream that has
    /// reached `pos` contributes its value even when poisoned, so consumers
    /// drain everything published before the fault. The alert is raised
    /// only once the upstream is exhausted (its value stays short of
    /// `pos`, and nothing more is coming).
    pub fn wait_for(&self, pos: i64) -> Result<i64> {
        let cached = self.last_min.load(Ordering::Acquire);
        if pos <= cached {
            return Ok(cached);
        }

        let upstream = self.upstream.read();
        assert!(!upstream.is_empty(), "barrier has no upstream sequences");

        let mut min_pos = i64::MAX;
        for seq in upstream.iter() {
            let mut wait = SpinWait::new();
            let contribution = loop {
                let v = seq.acquire();
                if v >= pos {
                    break v;
                }
                if seq.is_alerted() {
                    return Err(seq.alert_value().unwrap_or(WeftError::Eof));
                }
                wait.snooze();
            };
            min_pos = min_pos.min(contribution);
        }
        debug_assert_ne!(min_pos, i64::MAX);

        self.last_min.store(min_pos, Ordering::Release);
        Ok(min_pos)
    }

    /// Non-blocking probe: one acquire pass over the upstream set. Never
    /// raises; alerted upstreams still contribute what they published, so
    /// consumers can finish the drain.
    pub fn check(&self) -> i64 {
        let upstream = self.upstream.read();
        assert!(!upstream.is_empty(), "barrier has no upstream sequences");

        let mut min_pos = i64::MAX;
        for seq in upstream.iter() {
            min_pos = min_pos.min(seq.acquire());
        }

        // min only moves forward; refreshing the cache here is safe.
        let cached = self.last_min.load(Ordering::Acquire);
        if min_pos > cached {
            self.last_min.store(min_pos, Ordering::Release);
        }
        min_pos
    }

    /// Cached minimum from the last refresh.
    #[inline]
    pub fn last_min(&self) -> i64 {
        self.last_min.load(Ordering::Acquire)
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}
