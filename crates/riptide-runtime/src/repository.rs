//! Migration rendezvous.
//!
//! Donating and claiming workers never talk to each other directly. The donor
//! parks the key's window in its repository slot; the claimer picks it up when
//! its own MOVING_IN signal arrives. The handshake guarantees the donor's
//! MOVING_OUT is processed before the claimer's MOVING_IN, so each slot has at
//! most one writer and one reader per reconfiguration and the per-slot locks
//! are never contended.
//!
//! The per-worker finished flags tell the controller when every worker has
//! drained its part of a reconfiguration. Workers with nothing to move flip
//! their flag immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::window::CountWindow;

pub struct Repository {
    slots: Vec<Mutex<Option<CountWindow>>>,
    finished: Vec<AtomicBool>,
}

impl Repository {
    /// All finished flags start true: with no reconfiguration in flight every
    /// worker is trivially done.
    pub fn new(num_keys: usize, max_workers: usize) -> Self {
        Self {
            slots: (0..num_keys).map(|_| Mutex::new(None)).collect(),
            finished: (0..max_workers).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    pub fn donate(&self, key: usize, window: CountWindow) {
        *self.lock_slot(key) = Some(window);
    }

    /// Take the parked window for `key`, leaving the slot empty.
    pub fn take(&self, key: usize) -> Option<CountWindow> {
        self.lock_slot(key).take()
    }

    pub fn is_present(&self, key: usize) -> bool {
        self.lock_slot(key).is_some()
    }

    pub fn set_finished(&self, worker: usize, value: bool) {
        self.finished[worker].store(value, Ordering::Release);
    }

    pub fn finished(&self, worker: usize) -> bool {
        self.finished[worker].load(Ordering::Acquire)
    }

    /// Spin until every worker flag is true. Called by the controller once per
    /// reconfiguration; idempotent when nothing is in flight.
    pub fn wait_all_finished(&self) {
        let backoff = crossbeam_utils::Backoff::new();
        loop {
            if self
                .finished
                .iter()
                .all(|f| f.load(Ordering::Acquire))
            {
                return;
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn num_keys(&self) -> usize {
        self.slots.len()
    }

    fn lock_slot(&self, key: usize) -> std::sync::MutexGuard<'_, Option<CountWindow>> {
        self.slots[key].lock().unwrap_or_else(|e| e.into_inner())
    }
}
