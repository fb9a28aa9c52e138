//! Four-stage ring pipeline throughput demo.
//!
//! P publishes a counter into `source`; A squares it, B cubes it, C stores
//! cube - square. C follows A and B, and P follows C, so the single ring
//! allocation is recycled without ever overwriting an unconsumed slot.
//!
//! Usage: pipeline [iterations]   (default 10,000,000)

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use weft::disruptor::{ ReadCursor, RingBuffer, WriteCursor };

const CAPACITY: usize = 1024;

fn main() {
    tracing_subscriber::fmt::init();

    let iterations: i64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000_000);

    let source = Arc::new(RingBuffer::<i64>::new(CAPACITY));
    let square = Arc::new(RingBuffer::<i64>::new(CAPACITY));
    let cube = Arc::new(RingBuffer::<i64>::new(CAPACITY));
    let diff = Arc::new(RingBuffer::<i64>::new(CAPACITY));

    let p = Arc::new(WriteCursor::new("p", CAPACITY));
    let a = Arc::new(ReadCursor::new("a"));
    let b = Arc::new(ReadCursor::new("b"));
    let c = Arc::new(ReadCursor::new("c"));

    a.follows(&*p);
    b.follows(&*p);
    c.follows(&*a);
    c.follows(&*b);
    p.follows(&*c);

    let started = Instant::now();

    let producer = {
        let (source, p) = (source.clone(), p.clone());
        thread::spawn(move || {
            let mut pos = p.begin();
            let mut end = p.end();
            for i in 0..iterations {
                if pos >= end {
                    end = p.wait_for(pos).unwrap();
                }
                unsafe {
                    *source.get_mut(pos) = i;
                }
                p.publish(pos);
                pos += 1;
            }
            p.set_eof();
        })
    };

    let stage = |cursor: Arc<ReadCursor>, f: Box<dyn FnMut(i64) + Send>| {
        thread::spawn(move || {
            let mut f = f;
            let mut pos = cursor.begin();
            let mut end = cursor.end();
            loop {
                if pos >= end {
                    if pos > 0 {
                        cursor.publish(pos - 1);
                    }
                    match cursor.wait_for(pos) {
                        Ok(e) => {
                            end = e;
                        }
                        Err(_) => {
                            return;
                        }
                    }
                }
                f(pos);
                pos += 1;
            }
        })
    };

    let stage_a = {
        let (source, square) = (source.clone(), square.clone());
        stage(
            a.clone(),
            Box::new(move |pos| unsafe {
                let v = *source.get(pos);
                *square.get_mut(pos) = v.wrapping_mul(v);
            }),
        )
    };
    let stage_b = {
        let (source, cube) = (source.clone(), cube.clone());
        stage(
            b.clone(),
            Box::new(move |pos| unsafe {
                let v = *source.get(pos);
                *cube.get_mut(pos) = v.wrapping_mul(v).wrapping_mul(v);
            }),
        )
    };
    let stage_c = {
        let (square, cube, diff) = (square.clone(), cube.clone(), diff.clone());
        stage(
            c.clone(),
            Box::new(move |pos| unsafe {
                *diff.get_mut(pos) = (*cube.get(pos)).wrapping_sub(*square.get(pos));
            }),
        )
    };

    producer.join().unwrap();
    stage_a.join().unwrap();
    stage_b.join().unwrap();
    stage_c.join().unwrap();

    let elapsed = started.elapsed();
    let rate = (iterations as f64) / elapsed.as_secs_f64();
    println!("pipeline: {iterations} items in {elapsed:.2?} ({rate:.0} ops/sec)");

    let probe = iterations - 2;
    let expected = probe.wrapping_mul(probe).wrapping_mul(probe).wrapping_sub(probe.wrapping_mul(probe));
    println!("probe: diff[{probe}] = {} (expected {expected})", unsafe { *diff.get(probe) });
}
