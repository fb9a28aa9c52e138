//! weft - a cooperative strand/fiber runtime over a sequenced ring buffer.
//!
//! Two tightly coupled pieces:
//!
//! - [`disruptor`]: a lock-free, fixed-capacity ring pipeline. Producers
//!   publish monotonic positions on writer cursors; consumers gate on
//!   barriers over the sequences they follow; a single allocation per ring,
//!   no locks on the hot path.
//! - [`sched`]: logical tasks ("strands") running as stackful fibers over a
//!   small set of OS threads. Posting a task, waking a blocked fiber on
//!   another thread, and timer management all reuse the same ring
//!   primitive.
//!
//! ## Ring pipeline
//!
//! ```no_run
//! use weft::disruptor::{ ReadCursor, RingBuffer, WriteCursor };
//!
//! let ring = RingBuffer::<i64>::new(1024);
//! let producer = WriteCursor::new("producer", 1024);
//! let consumer = ReadCursor::new("consumer");
//! consumer.follows(&producer);
//! producer.follows(&consumer);
//!
//! // Producer side:
//! let pos = producer.begin();
//! unsafe { *ring.get_mut(pos) = 7 };
//! producer.publish(pos);
//!
//! // Consumer side:
//! let end = consumer.wait_for(pos).unwrap();
//! assert!(end > pos);
//! let value = unsafe { *ring.get(pos) };
//! consumer.publish(pos);
//! assert_eq!(value, 7);
//! ```
//!
//! ## Strands
//!
//! ```no_run
//! use weft::sched::Thread;
//!
//! let worker = Thread::new("worker");
//! let doubled = worker.call(|| 21 * 2).unwrap();
//! assert_eq!(doubled, 42);
//! worker.join();
//! ```

pub mod constants;
pub mod disruptor;
pub mod error;
pub mod fiber;
pub mod sched;
pub mod sync;
pub mod task;

pub use disruptor::{ Barrier, ReadCursor, RingBuffer, Sequence, SharedWriteCursor, WriteCursor };
pub use error::{ Result, WeftError };
pub use fiber::{ Fiber, StackAllocator };
pub use sched::{ sleep_for, sleep_until, Strand, Thread, ThreadPool };
pub use sync::{ Future, OnceSpinLock, Promise };
pub use task::{ FiberBody, InlineTask, PostedTask };

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
