//! Two threads posting a counter back and forth through their strand rings.
//!
//! Usage: pingpong [exponent]   (default 24: count to 2^24, then join)

use std::sync::Arc;
use std::time::Instant;

use weft::sched::Thread;
use weft::sync::Promise;

fn count(n: u64, limit: u64, current: Arc<Thread>, other: Arc<Thread>, finished: Arc<Promise<u64>>) {
    if n >= limit {
        finished.set_value(n);
        return;
    }
    let me = current.clone();
    let back = other.clone();
    other
        .post(move || count(n + 1, limit, back, me, finished))
        .expect("ping-pong post failed");
}

fn main() {
    tracing_subscriber::fmt::init();

    let exponent: u32 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(24);
    let limit = 1u64 << exponent;

    let a = Arc::new(Thread::new("ping"));
    let b = Arc::new(Thread::new("pong"));
    let finished = Arc::new(Promise::new("pingpong finished"));

    let started = Instant::now();
    {
        let (a2, b2, f) = (a.clone(), b.clone(), finished.clone());
        a.post(move || count(1, limit, a2, b2, f)).unwrap();
    }
    let total = finished.wait();
    let elapsed = started.elapsed();

    a.join();
    b.join();

    let rate = (total as f64) / elapsed.as_secs_f64();
    println!("pingpong: {total} messages in {elapsed:.2?} ({rate:.0} msgs/sec)");
}
