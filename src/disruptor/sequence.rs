//! Sequence - the monotonic position counter at the heart of every cursor.
//!
//! A `Sequence` is a cache-line padded signed 64-bit counter with
//! acquire/release semantics plus an "alert" side-channel. The alert carries
//! an out-of-band [`WeftError`] (EOF, cancellation, a failed stage) to every
//! barrier that gates on this sequence.

use std::sync::atomic::{ AtomicBool, AtomicI64, Ordering };

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::error::{ Result, WeftError };

/// Initial value of every cursor sequence, so that `begin() == 0`.
pub const INITIAL_SEQUENCE: i64 = -1;

/// Cache-line padded monotonic counter with an alert side-channel.
///
/// The counter is padded so that adjacent producer/consumer sequences never
/// share a cache line. The alert payload sits behind a mutex because it is
/// written at most once per stream and read only on the slow path; the
/// `alerted` flag keeps the hot-path check to a single relaxed load.
pub struct Sequence {
    value: CachePadded<AtomicI64>,
    alerted: AtomicBool,
    alert: Mutex<Option<WeftError>>,
}

impl Sequence {
    pub fn new(initial: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(initial)),
            alerted: AtomicBool::new(false),
            alert: Mutex::new(None),
        }
    }

    #[inline(always)]
    pub fn acquire(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn relaxed(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn store_release(&self, v: i64) {
        self.value.store(v, Ordering::Release);
    }

    #[inline(always)]
    pub fn fetch_add(&self, n: i64) -> i64 {
        self.value.fetch_add(n, Ordering::AcqRel)
    }

    #[inline(always)]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Poison this sequence. The first alert wins; later alerts are dropped.
    pub fn set_alert(&self, err: WeftError) {
        let mut slot = self.alert.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.alerted.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::Acquire)
    }

    /// Return the stored alert, if any.
    pub fn alert_value(&self) -> Option<WeftError> {
        if !self.is_alerted() {
            return None;
        }
        self.alert.lock().clone()
    }

    /// Re-raise the stored alert as an error.
    pub fn check_alert(&self) -> Result<()> {
        match self.alert_value() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_SEQUENCE)
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("value", &self.relaxed())
            .field("alerted", &self.is_alerted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_value() {
        let seq = Sequence::default();
        assert_eq!(seq.acquire(), INITIAL_SEQUENCE);
        assert!(!seq.is_alerted());
    }

    #[test]
    fn test_store_and_load() {
        let seq = Sequence::default();
        seq.store_release(41);
        assert_eq!(seq.acquire(), 41);
        assert_eq!(seq.relaxed(), 41);
    }

    #[test]
    fn test_compare_and_set() {
        let seq = Sequence::new(5);
        assert!(!seq.compare_and_set(4, 10));
        assert!(seq.compare_and_set(5, 10));
        assert_eq!(seq.acquire(), 10);
    }

    #[test]
    fn test_first_alert_wins() {
        let seq = Sequence::default();
        seq.set_alert(WeftError::Eof);
        seq.set_alert(WeftError::alert("late"));
        assert_eq!(seq.alert_value(), Some(WeftError::Eof));
        assert_eq!(seq.check_alert(), Err(WeftError::Eof));
    }

    #[test]
    fn test_padding_isolates_counters() {
        // Two sequences in one allocation must not share a cache line.
        assert!(std::mem::size_of::<Sequence>() >= 128);
    }
}
