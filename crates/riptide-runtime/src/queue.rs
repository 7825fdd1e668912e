//! Bounded single-producer single-consumer queues.
//!
//! Thin wrappers over `crossbeam-channel` bounded channels that pin down the
//! pipeline's waiting discipline in one place:
//!
//! - `try_push`: non-blocking, reports a full queue to the caller
//! - `push_backoff`: spin with exponential backoff for a bounded retry budget,
//!   then give up (the caller turns this into a bottleneck error)
//! - `push_blocking`: spin until accepted (control channels only)
//! - `recv`: spin briefly, then park until a message arrives
//! - `recv_latest`: wait for one message, then drain and keep only the newest
//!
//! Ownership of messages transfers on send; nothing is shared between the
//! endpoints.

use crossbeam_channel::{bounded, TryRecvError, TrySendError};
use crossbeam_utils::Backoff;

/// Capacity of the tuple and result queues.
pub const DATA_QUEUE_CAPACITY: usize = 10_000;

/// Capacity of the monitoring and command queues.
pub const CONTROL_QUEUE_CAPACITY: usize = 5;

/// Retry budget for `push_backoff` before the producer declares a bottleneck.
pub const DEFAULT_RETRY_BUDGET: usize = 1_000_000;

/// Outcome of a non-blocking poll.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll<T> {
    Item(T),
    Empty,
    /// Producer gone and queue drained.
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// Queue stayed full for the whole retry budget; the value is returned.
    Full(T),
    /// The consumer is gone.
    Closed(T),
}

pub fn spsc<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = bounded(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct QueueSender<T> {
    tx: crossbeam_channel::Sender<T>,
}

impl<T> QueueSender<T> {
    /// Non-blocking push.
    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        match self.tx.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(v)) => Err(PushError::Full(v)),
            Err(TrySendError::Disconnected(v)) => Err(PushError::Closed(v)),
        }
    }

    /// Push with spin backoff. On success returns the number of retries that
    /// were needed, which the producer uses as a congestion signal.
    pub fn push_backoff(&self, mut value: T, budget: usize) -> Result<usize, PushError<T>> {
        let backoff = Backoff::new();
        for attempt in 0..=budget {
            match self.tx.try_send(value) {
                Ok(()) => return Ok(attempt),
                Err(TrySendError::Full(v)) => {
                    value = v;
                    backoff.snooze();
                }
                Err(TrySendError::Disconnected(v)) => return Err(PushError::Closed(v)),
            }
        }
        Err(PushError::Full(value))
    }

    /// Push that never gives up while the consumer is alive.
    pub fn push_blocking(&self, mut value: T) -> Result<(), PushError<T>> {
        let backoff = Backoff::new();
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(v)) => {
                    value = v;
                    if backoff.is_completed() {
                        std::thread::yield_now();
                    } else {
                        backoff.snooze();
                    }
                }
                Err(TrySendError::Disconnected(v)) => return Err(PushError::Closed(v)),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueReceiver<T> {
    rx: crossbeam_channel::Receiver<T>,
}

impl<T> QueueReceiver<T> {
    /// Non-blocking pop. `None` means empty or closed-and-drained.
    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Non-blocking pop that distinguishes an empty queue from a dead
    /// producer.
    pub fn poll(&self) -> Poll<T> {
        match self.rx.try_recv() {
            Ok(v) => Poll::Item(v),
            Err(TryRecvError::Empty) => Poll::Empty,
            Err(TryRecvError::Disconnected) => Poll::Closed,
        }
    }

    /// Spin briefly, then park. `None` only when the producer is gone and the
    /// queue is drained.
    pub fn recv(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            match self.rx.try_recv() {
                Ok(v) => return Some(v),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {
                    if backoff.is_completed() {
                        return self.rx.recv().ok();
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Wait for at least one message, then drain the queue and keep only the
    /// most recent one. Used for monitoring channels where stale samples are
    /// worthless.
    pub fn recv_latest(&self) -> Option<T> {
        let mut latest = self.recv()?;
        while let Some(next) = self.try_pop() {
            latest = next;
        }
        Some(latest)
    }

    /// Drain without blocking, keeping the most recent message if any.
    pub fn try_recv_latest(&self) -> Option<T> {
        let mut latest = None;
        while let Some(next) = self.try_pop() {
            latest = Some(next);
        }
        latest
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_push_full() {
        let (tx, _rx) = spsc(2);
        assert!(tx.try_push(1).is_ok());
        assert!(tx.try_push(2).is_ok());
        assert_eq!(tx.try_push(3), Err(PushError::Full(3)));
    }

    #[test]
    fn test_push_backoff_counts_retries() {
        let (tx, rx) = spsc(1);
        assert_eq!(tx.push_backoff(1, 10).unwrap(), 0);
        // Queue now full; a tiny budget must fail and hand the value back.
        assert_eq!(tx.push_backoff(2, 3), Err(PushError::Full(2)));
        assert_eq!(rx.try_pop(), Some(1));
    }

    #[test]
    fn test_recv_latest_drains() {
        let (tx, rx) = spsc(8);
        for i in 0..5 {
            tx.try_push(i).unwrap();
        }
        assert_eq!(rx.recv_latest(), Some(4));
        assert!(rx.try_pop().is_none());
    }

    #[test]
    fn test_recv_returns_none_on_close() {
        let (tx, rx) = spsc::<i32>(2);
        drop(tx);
        assert!(rx.recv().is_none());
    }

    #[test]
    fn test_closed_push() {
        let (tx, rx) = spsc(2);
        drop(rx);
        assert_eq!(tx.try_push(7), Err(PushError::Closed(7)));
    }

    #[test]
    fn test_cross_thread_order() {
        let (tx, rx) = spsc(4);
        let producer = std::thread::spawn(move || {
            for i in 0..100 {
                tx.push_blocking(i).unwrap();
            }
        });
        let mut expected = 0;
        while let Some(v) = rx.recv() {
            assert_eq!(v, expected);
            expected += 1;
        }
        assert_eq!(expected, 100);
        producer.join().unwrap();
    }
}
