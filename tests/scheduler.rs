//! Scheduler scenarios: strands, fibers, promises and threads working
//! together across real OS threads.

use std::panic::{ self, AssertUnwindSafe };
use std::sync::Arc;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::time::Duration;

use parking_lot::Mutex;

use weft::error::WeftError;
use weft::sched::{ sleep_for, Thread };
use weft::sync::Promise;

/// Ping-pong: two threads posting `count(n + 1)` at each other until the
/// limit, then a clean shutdown through join.
#[test]
fn test_pingpong_counts_across_two_threads() {
    const LIMIT: u64 = 1 << 16;

    fn pong(n: u64, current: Arc<Thread>, other: Arc<Thread>, finished: Arc<Promise<u64>>) {
        if n >= LIMIT {
            finished.set_value(n);
            return;
        }
        let me = current.clone();
        let back = other.clone();
        other
            .post(move || pong(n + 1, back, me, finished))
            .expect("ping-pong post failed");
    }

    let a = Arc::new(Thread::new("ping"));
    let b = Arc::new(Thread::new("pong"));
    let finished = Arc::new(Promise::new("pingpong finished"));

    {
        let (a2, b2, f) = (a.clone(), b.clone(), finished.clone());
        a.post(move || pong(1, a2, b2, f)).unwrap();
    }

    assert_eq!(finished.wait(), LIMIT);
    a.join();
    b.join();
}

/// Tasks posted to one strand run in slot order.
#[test]
fn test_strand_executes_posts_in_order() {
    let worker = Thread::new("ordered");
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let seen = seen.clone();
        worker.post(move || seen.lock().push(i)).unwrap();
    }
    worker.strand().wait();

    let seen = seen.lock();
    assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    drop(seen);
    worker.join();
}

/// Many foreign threads posting into one strand: every task runs, none
/// twice, and the multi-writer cursor keeps the ring consistent.
#[test]
fn test_concurrent_posters_all_land() {
    const POSTERS: usize = 4;
    const PER_POSTER: usize = 1_000;

    let worker = Arc::new(Thread::new("sink"));
    let hits = Arc::new(AtomicUsize::new(0));

    let posters: Vec<_> = (0..POSTERS)
        .map(|_| {
            let worker = worker.clone();
            let hits = hits.clone();
            std::thread::spawn(move || {
                for _ in 0..PER_POSTER {
                    let hits = hits.clone();
                    worker
                        .post(move || {
                            hits.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for p in posters {
        p.join().unwrap();
    }

    worker.strand().wait();
    assert_eq!(hits.load(Ordering::Relaxed), POSTERS * PER_POSTER);
    worker.join();
}

/// `spawn` returns a future; the value crosses threads.
#[test]
fn test_spawn_future_roundtrip() {
    let worker = Thread::new("math");
    let future = worker.spawn(|| (1..=10).product::<u64>()).unwrap();
    assert_eq!(future.wait(), 3_628_800);
    worker.join();
}

/// A panic inside a spawned closure is captured into the promise and
/// re-raised in the waiter, not in the worker thread.
#[test]
fn test_spawn_panic_reaches_the_waiter() {
    let worker = Thread::new("doomed");
    let future = worker.spawn(|| -> u32 { panic!("task exploded") }).unwrap();
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || future.wait()));
    assert!(outcome.is_err());

    // The worker survived; it still executes work.
    assert_eq!(worker.call(|| 5).unwrap(), 5);
    worker.join();
}

/// Synchronous cross-strand call: the result comes back bit-identical and
/// the calling fiber shows up in its strand's blocked set while it waits.
#[test]
fn test_call_blocks_caller_and_returns_result() {
    let caller = Thread::new("caller");
    let executor = Arc::new(Thread::new("executor"));

    let caller_strand = caller.strand().clone();
    let exec = executor.clone();
    let future = caller
        .spawn(move || {
            let observer = caller_strand.clone();
            let during = exec
                .call(move || {
                    sleep_for(Duration::from_micros(100));
                    observer.blocked_len()
                })
                .unwrap();
            (during, caller_strand.blocked_len())
        })
        .unwrap();

    let (during, after) = future.wait();
    assert_eq!(during, 1, "calling fiber was not in the blocked set");
    assert_eq!(after, 0, "blocked set not empty after the call returned");
    caller.join();
    executor.join();
}

/// `call` matches a direct invocation.
#[test]
fn test_call_is_bit_identical_to_direct() {
    let worker = Thread::new("identical");
    let direct = (0..50).map(|i| i * i).sum::<i64>();
    assert_eq!(worker.call(|| (0..50).map(|i| i * i).sum::<i64>()).unwrap(), direct);
    worker.join();
}

/// A panic inside `call` unwinds in the caller.
#[test]
fn test_call_panic_propagates_to_caller() {
    let worker = Thread::new("thrower");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = worker.call(|| -> u32 { panic!("called closure panicked") });
    }));
    assert!(outcome.is_err());
    worker.join();
}

/// Two strands pinned to one thread can still call into each other: the
/// blocked caller hands control back to the host loop, which drains the
/// callee strand.
#[test]
fn test_cross_strand_call_on_one_thread() {
    let host = Thread::new("shared-host");
    let second = host.new_strand("second");

    let future = host
        .spawn(move || second.call(|| 40).unwrap() + 2)
        .unwrap();
    assert_eq!(future.wait(), 42);
    host.join();
}

/// Cancel poisons the post cursor: new posts fail fast.
#[test]
fn test_cancel_rejects_new_posts() {
    let worker = Thread::new("cancelled");
    worker.post(|| {}).unwrap();
    worker.strand().cancel();

    assert_eq!(worker.post(|| {}), Err(WeftError::Cancelled));
    assert!(worker.strand().is_cancelled());
    worker.join();
}

/// Sleeping fibers wake in expiry order, and sleeps overlap instead of
/// serialising the strand.
#[test]
fn test_sleep_timers_fire_in_expiry_order() {
    let worker = Thread::new("sleepy");
    let order = Arc::new(Mutex::new(Vec::new()));

    let started = std::time::Instant::now();
    for (label, delay_ms) in [("slow", 40u64), ("medium", 20), ("fast", 5)] {
        let order = order.clone();
        worker
            .post(move || {
                sleep_for(Duration::from_millis(delay_ms));
                order.lock().push(label);
            })
            .unwrap();
    }

    worker.strand().wait();
    let elapsed = started.elapsed();
    assert_eq!(*order.lock(), vec!["fast", "medium", "slow"]);
    // Overlapping sleeps: the strand finished in roughly the longest delay,
    // not the sum. Generous bound to keep CI happy.
    assert!(elapsed < Duration::from_millis(120), "sleeps serialised: {elapsed:?}");
    worker.join();
}

/// The strand keeps draining posts while one of its fibers is asleep.
#[test]
fn test_blocked_fiber_does_not_stall_the_strand() {
    let worker = Thread::new("busy");
    let log = Arc::new(Mutex::new(Vec::new()));

    {
        let log = log.clone();
        worker
            .post(move || {
                log.lock().push("sleeper-start");
                sleep_for(Duration::from_millis(20));
                log.lock().push("sleeper-end");
            })
            .unwrap();
    }
    {
        let log = log.clone();
        worker.post(move || log.lock().push("quick")).unwrap();
    }

    worker.strand().wait();
    let log = log.lock();
    assert_eq!(*log, vec!["sleeper-start", "quick", "sleeper-end"]);
    drop(log);
    worker.join();
}

/// Promise waited on from a plain OS thread (no strand to suspend).
#[test]
fn test_promise_bridges_to_foreign_thread() {
    let worker = Thread::new("bridge");
    let promise = Arc::new(Promise::new("bridged value"));

    {
        let promise = promise.clone();
        worker
            .post(move || {
                promise.set_value(String::from("over the ring"));
            })
            .unwrap();
    }
    assert_eq!(promise.wait(), "over the ring");
    worker.join();
}
