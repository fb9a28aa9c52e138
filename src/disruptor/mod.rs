//! Disruptor-style sequenced ring buffer.
//!
//! The flow-control machinery underneath the whole runtime: padded
//! [`Sequence`] counters, [`Barrier`]s over upstream sequences, the three
//! cursor flavours, and the raw power-of-two [`RingBuffer`].
//!
//! A pipeline is wired by making each stage's cursor `follows()` the stages
//! it consumes, and making the producer follow the final consumer so slots
//! are never overwritten before they are drained.

pub mod barrier;
pub mod cursor;
pub mod ring_buffer;
pub mod sequence;
pub mod wait_strategy;

pub use barrier::Barrier;
pub use cursor::{ Cursored, ReadCursor, SharedWriteCursor, WriteCursor };
pub use ring_buffer::RingBuffer;
pub use sequence::{ Sequence, INITIAL_SEQUENCE };
pub use wait_strategy::SpinWait;
