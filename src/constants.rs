//! Runtime tuning constants.

use static_assertions::const_assert;
use std::time::Duration;

/// Slots in a strand's task ring (must be a power of 2).
pub const STRAND_RING_SLOTS: usize = 128;

/// Slots in a thread's unblock ring (must be a power of 2).
pub const UNBLOCK_RING_SLOTS: usize = 1024;

/// Inline payload available to a closure posted to a strand.
pub const POSTED_TASK_BYTES: usize = 104;

/// Inline payload available to a fiber body.
pub const FIBER_BODY_BYTES: usize = 128;

/// Acquire-load attempts before a waiter starts yielding.
pub const SPIN_TRIES: u32 = 1_000;

/// Yields before a waiter starts sleeping.
pub const YIELD_TRIES: u32 = 1_000;

/// Sleep interval once a wait has exhausted its spin and yield tiers.
pub const SLEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Empty run-loop iterations before a thread parks on its condvar.
pub const PARK_SPIN_LIMIT: u32 = 1_000;

/// Default fiber stack size (excluding the guard page).
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

const_assert!(STRAND_RING_SLOTS.is_power_of_two());
const_assert!(UNBLOCK_RING_SLOTS.is_power_of_two());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_sizes_are_powers_of_two() {
        assert!(STRAND_RING_SLOTS.is_power_of_two());
        assert!(UNBLOCK_RING_SLOTS.is_power_of_two());
    }

    #[test]
    fn test_fiber_body_fits_a_boxed_chain() {
        // A body holding a boxed closure plus a couple of words must fit.
        assert!(FIBER_BODY_BYTES >= POSTED_TASK_BYTES);
    }
}
