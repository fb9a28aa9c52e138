//! Ring pipeline scenarios: streams of published positions flowing through
//! cursor-gated stages on real OS threads.

use std::sync::Arc;
use std::thread;

use weft::disruptor::{ Cursored, ReadCursor, RingBuffer, WriteCursor };
use weft::error::WeftError;

/// Single producer, single consumer, one million items in order.
#[test]
fn test_spsc_million_items_in_order() {
    const CAPACITY: usize = 1024;
    const ITEMS: i64 = 1_000_000;

    let ring = Arc::new(RingBuffer::<i64>::new(CAPACITY));
    let producer = Arc::new(WriteCursor::new("producer", CAPACITY));
    let consumer = Arc::new(ReadCursor::new("consumer"));
    consumer.follows(&*producer);
    producer.follows(&*consumer);

    let publisher = {
        let ring = ring.clone();
        let producer = producer.clone();
        thread::spawn(move || {
            let mut pos = producer.begin();
            let mut end = producer.end();
            for i in 0..ITEMS {
                if pos >= end {
                    end = producer.wait_for(pos).unwrap();
                    // Backpressure never admits more than one ring of slots.
                    assert!(end - pos <= CAPACITY as i64);
                }
                unsafe {
                    *ring.get_mut(pos) = i;
                }
                producer.publish(pos);
                pos += 1;
            }
            producer.set_eof();
        })
    };

    let mut expected = 0i64;
    let mut pos = consumer.begin();
    let mut end = consumer.end();
    loop {
        if pos >= end {
            if pos > 0 {
                consumer.publish(pos - 1);
            }
            match consumer.wait_for(pos) {
                Ok(e) => {
                    end = e;
                }
                Err(WeftError::Eof) => {
                    break;
                }
                Err(err) => panic!("consumer saw unexpected error: {err}"),
            }
        } else {
            let v = unsafe { *ring.get(pos) };
            assert_eq!(v, expected, "out-of-order value at position {pos}");
            expected += 1;
            pos += 1;
        }
    }

    assert_eq!(expected, ITEMS, "consumer missed published values");
    publisher.join().unwrap();
}

struct Stage {
    cursor: Arc<ReadCursor>,
}

impl Stage {
    /// Drive one pipeline stage: apply `f` to each position until `limit`
    /// positions have been handled or an upstream raises.
    fn drive<F>(&self, limit: i64, mut f: F) -> Result<(), WeftError>
    where
        F: FnMut(i64),
    {
        let mut pos = self.cursor.begin();
        let mut end = self.cursor.end();
        while pos < limit {
            if pos >= end {
                if pos > 0 {
                    self.cursor.publish(pos - 1);
                }
                end = self.cursor.wait_for(pos)?;
            }
            f(pos);
            pos += 1;
        }
        self.cursor.publish(pos - 1);
        Ok(())
    }
}

/// Three-stage pipeline: P publishes `source`, A squares, B cubes, C takes
/// the difference; P follows C so no slot is recycled before C consumed it.
#[test]
fn test_three_stage_pipeline_diff_of_cube_and_square() {
    const CAPACITY: usize = 1024;
    const ITEMS: i64 = 500_000;

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

    let producer = {
        let source = source.clone();
        let p = p.clone();
        thread::spawn(move || {
            let mut pos = p.begin();
            let mut end = p.end();
            for i in 0..ITEMS {
                if pos >= end {
                    end = p.wait_for(pos).unwrap();
                }
                unsafe {
                    *source.get_mut(pos) = i;
                }
                p.publish(pos);
                pos += 1;
            }
        })
    };

    let stage_a = {
        let (source, square) = (source.clone(), square.clone());
        let stage = Stage { cursor: a.clone() };
        thread::spawn(move || {
            stage
                .drive(ITEMS, |pos| unsafe {
                    let v = *source.get(pos);
                    *square.get_mut(pos) = v * v;
                })
                .unwrap();
        })
    };

    let stage_b = {
        let (source, cube) = (source.clone(), cube.clone());
        let stage = Stage { cursor: b.clone() };
        thread::spawn(move || {
            stage
                .drive(ITEMS, |pos| unsafe {
                    let v = *source.get(pos);
                    *cube.get_mut(pos) = v * v * v;
                })
                .unwrap();
        })
    };

    let stage_c = {
        let (square, cube, diff) = (square.clone(), cube.clone(), diff.clone());
        let stage = Stage { cursor: c.clone() };
        thread::spawn(move || {
            stage
                .drive(ITEMS, |pos| unsafe {
                    *diff.get_mut(pos) = *cube.get(pos) - *square.get(pos);
                })
                .unwrap();
        })
    };

    producer.join().unwrap();
    stage_a.join().unwrap();
    stage_b.join().unwrap();
    stage_c.join().unwrap();

    // The producer never laps the final consumer by more than the ring.
    let gap = p.sequence().acquire() - c.sequence().acquire();
    assert!(gap <= CAPACITY as i64, "producer overran the final consumer by {gap}");

    // The last ring of results is still resident; verify it end to end.
    for i in ITEMS - (CAPACITY as i64)..ITEMS {
        let expect = i * i * i - i * i;
        assert_eq!(unsafe { *diff.get(i) }, expect, "bad result at position {i}");
    }
}

/// Mid-stream poison: B poisons C, every stage drains what was published
/// and exits; nothing deadlocks.
#[test]
fn test_pipeline_alert_propagates_without_deadlock() {
    const CAPACITY: usize = 1024;
    const ITEMS: i64 = 500_000;
    const FAULT_AT: i64 = 49_340;

    let source = Arc::new(RingBuffer::<i64>::new(CAPACITY));
    let cube = Arc::new(RingBuffer::<i64>::new(CAPACITY));

    let p = Arc::new(WriteCursor::new("p", CAPACITY));
    let a = Arc::new(ReadCursor::new("a"));
    let b = Arc::new(ReadCursor::new("b"));
    let c = Arc::new(ReadCursor::new("c"));

    a.follows(&*p);
    b.follows(&*p);
    c.follows(&*a);
    c.follows(&*b);
    p.follows(&*c);

    let producer = {
        let source = source.clone();
        let p = p.clone();
        thread::spawn(move || {
            let mut pos = p.begin();
            let mut end = p.end();
            for i in 0..ITEMS {
                if pos >= end {
                    end = match p.wait_for(pos) {
                        Ok(e) => e,
                        Err(err) => {
                            // C is poisoned; stop publishing and tell our
                            // own followers the stream is over.
                            p.set_alert(err.clone());
                            return (pos, Some(err));
                        }
                    };
                }
                unsafe {
                    *source.get_mut(pos) = i;
                }
                p.publish(pos);
                pos += 1;
            }
            p.set_eof();
            (pos, None)
        })
    };

    // A: pass-through observer of `source`.
    let stage_a = {
        let stage = Stage { cursor: a.clone() };
        thread::spawn(move || {
            let mut seen = 0i64;
            let outcome = stage.drive(ITEMS, |_pos| {
                seen += 1;
            });
            (seen, outcome)
        })
    };

    // B: cubes until it reaches FAULT_AT, then poisons C and bails.
    let stage_b = {
        let (source, cube) = (source.clone(), cube.clone());
        let (b, c) = (b.clone(), c.clone());
        thread::spawn(move || -> Result<(), WeftError> {
            let fault = WeftError::alert("b stage fault");
            let mut pos = b.begin();
            let mut end = b.end();
            loop {
                if pos >= end {
                    match b.wait_for(pos) {
                        Ok(e) => {
                            end = e;
                        }
                        Err(err) => {
                            return Err(err);
                        }
                    }
                }
                if pos == FAULT_AT {
                    c.set_alert(fault.clone());
                    b.set_alert(fault.clone());
                    return Err(fault);
                }
                unsafe {
                    let v = *source.get(pos);
                    *cube.get_mut(pos) = v * v * v;
                }
                b.publish(pos);
                pos += 1;
            }
        })
    };

    // C: consumes A and B output until an upstream raises.
    let stage_c = {
        let stage = Stage { cursor: c.clone() };
        let c = c.clone();
        thread::spawn(move || {
            let outcome = stage.drive(ITEMS, |_pos| {});
            if let Err(err) = &outcome {
                c.set_alert(err.clone());
            }
            outcome
        })
    };

    let (p_pos, p_err) = producer.join().unwrap();
    let (a_seen, a_outcome) = stage_a.join().unwrap();
    let b_outcome = stage_b.join().unwrap();
    let c_outcome = stage_c.join().unwrap();

    // B raised its own fault; C saw it through the barrier.
    assert_eq!(b_outcome, Err(WeftError::alert("b stage fault")));
    assert_eq!(c_outcome, Err(WeftError::alert("b stage fault")));

    // The producer observed the poisoned consumer and stopped early.
    assert_eq!(p_err, Some(WeftError::alert("b stage fault")));
    assert!(p_pos < ITEMS, "producer should have stopped before the full stream");

    // A drained only what the producer had published before stopping.
    match a_outcome {
        Ok(()) => assert_eq!(a_seen, ITEMS),
        Err(err) => {
            assert_eq!(err, WeftError::alert("b stage fault"));
            assert!(a_seen <= p_pos, "A consumed past the last published position");
        }
    }
}
