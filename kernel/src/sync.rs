//! A classic counting semaphore, used for the parent/child lifecycle
//! handshake in `process.rs` (spec.md 3, "Three counting semaphores per
//! process, each initialized to 0").
//!
//! `down`/`up` are built directly on the scheduler's existing
//! `yield_execution`/`enqueue` pair: `yield_execution` hands off the CPU
//! without requeuing the caller (the same primitive `Devfs::read` already
//! uses to block on keyboard input), and `enqueue` is how a blocked thread
//! gets woken back up.

use alloc::collections::vec_deque::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::scheduler::{self, Thread};

pub struct Semaphore {
    count: AtomicUsize,
    waiters: Mutex<VecDeque<Arc<Mutex<Thread>>>>,
}

impl Semaphore {
    pub const fn new(value: usize) -> Self {
        Semaphore {
            count: AtomicUsize::new(value),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn down(&self) {
        loop {
            if self
                .count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                    if c > 0 { Some(c - 1) } else { None }
                })
                .is_ok()
            {
                return;
            }

            if let Some(current) = scheduler::current_thread() {
                self.waiters.lock().push_back(current);
            }
            scheduler::yield_execution();
        }
    }

    /// Increments the count and wakes one waiter, if any.
    pub fn up(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        if let Some(thread) = self.waiters.lock().pop_front() {
            scheduler::enqueue(thread);
        }
    }
}
