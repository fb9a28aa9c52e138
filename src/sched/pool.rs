//! Thread pool - round-robin dispatch of free-standing work.
//!
//! For closures that do not belong to any particular strand: each `post` /
//! `spawn` / `call` lands on the next member thread's main strand.

use std::sync::atomic::{ AtomicUsize, Ordering };

use crate::error::Result;
use crate::sched::thread::Thread;
use crate::sync::promise::Future;

pub struct ThreadPool {
    threads: Vec<Thread>,
    next: AtomicUsize,
}

/// Pool member names; also caps the pool size.
const POOL_NAMES: [&str; 16] = [
    "pool-0", "pool-1", "pool-2", "pool-3", "pool-4", "pool-5", "pool-6", "pool-7", "pool-8",
    "pool-9", "pool-10", "pool-11", "pool-12", "pool-13", "pool-14", "pool-15",
];

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        let n = num_threads.clamp(1, POOL_NAMES.len());
        let threads = POOL_NAMES[..n].iter().map(|&name| Thread::new(name)).collect();
        Self {
            threads,
            next: AtomicUsize::new(0),
        }
    }

    /// Size the pool to the machine: half the logical CPUs, between 2 and 8.
    pub fn auto() -> Self {
        let cpus = num_cpus::get();
        Self::new((cpus / 2).clamp(2, 8))
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn next_thread(&self) -> &Thread {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        &self.threads[i]
    }

    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.next_thread().post(f)
    }

    pub fn spawn<F, R>(&self, f: F) -> Result<Future<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.next_thread().spawn(f)
    }

    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.next_thread().call(f)
    }

    /// Stop and join every member thread.
    pub fn join(&self) {
        for thread in &self.threads {
            thread.join();
        }
    }
}
