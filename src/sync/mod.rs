//! Blocking primitives built for the one-shot case.

pub mod once_lock;
pub mod promise;

pub use once_lock::{ OnceGuard, OnceSpinLock };
pub use promise::{ Future, Promise };
