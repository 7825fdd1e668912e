//! Window workers.
//!
//! Each worker owns the windows of the keys currently routed to it and runs a
//! spin loop over its input queue. Migration is driven entirely by in-band
//! signal tuples:
//!
//! - MOVING_OUT: park the key's window in the repository (an empty window if
//!   the key never produced one here) so the new owner can claim it.
//! - MOVING_IN: claim the key's window from the repository. If the donor has
//!   not parked it yet, the key goes on the pending set and data tuples for it
//!   are buffered and replayed in order once the claim succeeds.
//!
//! The worker flips its repository finished flag back to true as soon as its
//! pending set drains. On EOS it first drains any pending claims, so no window
//! is ever stranded in the repository.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use riptide_core::{Punctuation, Tuple};

use crate::error::{PipelineError, PipelineResult};
use crate::messages::{ResultMsg, WorkerReport, WorkerSample};
use crate::queue::{Poll, QueueReceiver, QueueSender};
use crate::repository::Repository;
use crate::window::CountWindow;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker: usize,
    pub num_keys: usize,
    pub window_size: usize,
    pub window_slide: usize,
    pub control_step: Duration,
}

pub struct Worker {
    cfg: WorkerConfig,
    input: QueueReceiver<Tuple>,
    output: QueueSender<ResultMsg>,
    monitor: QueueSender<WorkerReport>,
    repo: Arc<Repository>,
    windows: FxHashMap<usize, CountWindow>,
    pending_in: FxHashMap<usize, Vec<Tuple>>,
    counters: Counters,
}

struct Counters {
    elements: u64,
    computations: u64,
    elements_per_class: Vec<u64>,
    computations_per_class: Vec<u64>,
    tcalc_per_class_us: Vec<f64>,
}

impl Counters {
    fn new(num_keys: usize) -> Self {
        Self {
            elements: 0,
            computations: 0,
            elements_per_class: vec![0; num_keys],
            computations_per_class: vec![0; num_keys],
            tcalc_per_class_us: vec![0.0; num_keys],
        }
    }

    fn take_sample(&mut self, worker: usize) -> WorkerSample {
        let num_keys = self.tcalc_per_class_us.len();
        let sample = WorkerSample {
            worker,
            elements: self.elements,
            computations: self.computations,
            elements_per_class: std::mem::replace(&mut self.elements_per_class, vec![0; num_keys]),
            computations_per_class: std::mem::replace(
                &mut self.computations_per_class,
                vec![0; num_keys],
            ),
            tcalc_per_class_us: std::mem::replace(&mut self.tcalc_per_class_us, vec![0.0; num_keys]),
        };
        self.elements = 0;
        self.computations = 0;
        sample
    }
}

impl Worker {
    pub fn new(
        cfg: WorkerConfig,
        input: QueueReceiver<Tuple>,
        output: QueueSender<ResultMsg>,
        monitor: QueueSender<WorkerReport>,
        repo: Arc<Repository>,
    ) -> Self {
        let num_keys = cfg.num_keys;
        Self {
            cfg,
            input,
            output,
            monitor,
            repo,
            windows: FxHashMap::default(),
            pending_in: FxHashMap::default(),
            counters: Counters::new(num_keys),
        }
    }

    pub fn run(mut self) -> PipelineResult<()> {
        let backoff = Backoff::new();
        let mut last_report = Instant::now();
        loop {
            self.try_claims()?;

            match self.input.poll() {
                Poll::Item(tuple) if tuple.is_eos() => {
                    self.finish()?;
                    return Ok(());
                }
                Poll::Item(tuple) => {
                    self.handle(tuple)?;
                    backoff.reset();
                }
                Poll::Closed => {
                    return Err(PipelineError::Disconnected { peer: "emitter" });
                }
                Poll::Empty => {
                    if backoff.is_completed() {
                        std::thread::yield_now();
                    } else {
                        backoff.snooze();
                    }
                }
            }

            if last_report.elapsed() >= self.cfg.control_step {
                let sample = self.counters.take_sample(self.cfg.worker);
                // Stale monitoring is worthless; drop rather than block.
                let _ = self.monitor.try_push(WorkerReport::Monitoring(sample));
                last_report = Instant::now();
            }
        }
    }

    fn handle(&mut self, tuple: Tuple) -> PipelineResult<()> {
        let key = tuple.key as usize;
        match tuple.punctuation {
            Punctuation::MovingOut => {
                let window = self
                    .windows
                    .remove(&key)
                    .unwrap_or_else(|| CountWindow::new(self.cfg.window_size, self.cfg.window_slide));
                trace!(worker = self.cfg.worker, key, "donating window");
                self.repo.donate(key, window);
                Ok(())
            }
            Punctuation::MovingIn => {
                if let Some(window) = self.repo.take(key) {
                    self.windows.insert(key, window);
                } else {
                    debug!(worker = self.cfg.worker, key, "window not parked yet, pending");
                    self.pending_in.entry(key).or_default();
                }
                self.after_claim_progress();
                Ok(())
            }
            Punctuation::Testing => {
                // Probe: exercises the compute path so unseen classes get a
                // service-time estimate, but no result leaves the worker.
                let window = self.window_mut(key);
                window.insert(tuple);
                if window.is_computable() {
                    let start = Instant::now();
                    let _ = window.compute();
                    let elapsed = start.elapsed().as_secs_f64() * 1e6;
                    self.counters.tcalc_per_class_us[key] += elapsed;
                    self.counters.computations_per_class[key] += 1;
                    self.counters.computations += 1;
                }
                Ok(())
            }
            Punctuation::None => {
                if let Some(buf) = self.pending_in.get_mut(&key) {
                    buf.push(tuple);
                    return Ok(());
                }
                self.process(tuple)
            }
        }
    }

    fn process(&mut self, tuple: Tuple) -> PipelineResult<()> {
        let key = tuple.key as usize;
        self.counters.elements += 1;
        self.counters.elements_per_class[key] += 1;

        let window = self.window_mut(key);
        window.insert(tuple);
        if window.is_computable() {
            let start = Instant::now();
            let result = window.compute();
            let elapsed = start.elapsed().as_secs_f64() * 1e6;
            self.counters.tcalc_per_class_us[key] += elapsed;
            self.counters.computations_per_class[key] += 1;
            self.counters.computations += 1;

            self.output
                .push_blocking(ResultMsg::Result(Box::new(result)))
                .map_err(|_| PipelineError::Disconnected { peer: "collector" })?;
        }
        Ok(())
    }

    fn window_mut(&mut self, key: usize) -> &mut CountWindow {
        self.windows
            .entry(key)
            .or_insert_with(|| CountWindow::new(self.cfg.window_size, self.cfg.window_slide))
    }

    /// Claim any pending windows whose donors have parked them, replaying the
    /// tuples buffered while the claim was outstanding.
    fn try_claims(&mut self) -> PipelineResult<()> {
        if self.pending_in.is_empty() {
            return Ok(());
        }
        let ready: Vec<usize> = self
            .pending_in
            .keys()
            .copied()
            .filter(|&k| self.repo.is_present(k))
            .collect();
        for key in ready {
            if let Some(window) = self.repo.take(key) {
                self.windows.insert(key, window);
            }
            let buffered = self.pending_in.remove(&key).unwrap_or_default();
            trace!(
                worker = self.cfg.worker,
                key,
                replay = buffered.len(),
                "claimed window"
            );
            for tuple in buffered {
                self.process(tuple)?;
            }
        }
        self.after_claim_progress();
        Ok(())
    }

    fn after_claim_progress(&mut self) {
        if self.pending_in.is_empty() {
            self.repo.set_finished(self.cfg.worker, true);
        }
    }

    /// EOS: drain outstanding claims first, then report and sign off.
    fn finish(&mut self) -> PipelineResult<()> {
        let backoff = Backoff::new();
        while !self.pending_in.is_empty() {
            self.try_claims()?;
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
        self.repo.set_finished(self.cfg.worker, true);

        let sample = self.counters.take_sample(self.cfg.worker);
        let _ = self.monitor.try_push(WorkerReport::Monitoring(sample));
        let _ = self.monitor.push_blocking(WorkerReport::Eos {
            worker: self.cfg.worker,
        });
        // At stream end the collector may already be gone; the sign-off
        // itself carries no results, so a closed queue is not a failure.
        if self
            .output
            .push_blocking(ResultMsg::Eos {
                worker: self.cfg.worker,
            })
            .is_err()
        {
            debug!(worker = self.cfg.worker, "collector gone before sign-off");
        }
        debug!(worker = self.cfg.worker, "worker drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::spsc;
    use riptide_core::KEY_EOS;

    fn cfg(worker: usize) -> WorkerConfig {
        WorkerConfig {
            worker,
            num_keys: 4,
            window_size: 4,
            window_slide: 2,
            control_step: Duration::from_secs(3600),
        }
    }

    fn data(key: i32, internal_id: i64) -> Tuple {
        Tuple {
            key,
            internal_id,
            bid_price: 10.0,
            ask_price: 10.5,
            ..Default::default()
        }
    }

    fn signal(key: i32, punctuation: Punctuation) -> Tuple {
        Tuple {
            key,
            punctuation,
            ..Default::default()
        }
    }

    fn eos() -> Tuple {
        Tuple {
            key: KEY_EOS,
            ..Default::default()
        }
    }

    #[test]
    fn test_results_every_slide() {
        let (tx, rx) = spsc(64);
        let (out_tx, out_rx) = spsc(64);
        let (mon_tx, _mon_rx) = spsc(8);
        let repo = Arc::new(Repository::new(4, 1));
        let worker = Worker::new(cfg(0), rx, out_tx, mon_tx, repo);

        for i in 0..8 {
            tx.try_push(data(1, i)).unwrap();
        }
        tx.try_push(eos()).unwrap();
        worker.run().unwrap();

        let mut results = Vec::new();
        while let Some(msg) = out_rx.try_pop() {
            match msg {
                ResultMsg::Result(r) => results.push(r.internal_id),
                ResultMsg::Eos { worker } => assert_eq!(worker, 0),
            }
        }
        assert_eq!(results, vec![1, 3, 5, 7]);
    }

    #[test]
    fn test_moving_out_absent_key_donates_empty() {
        let (tx, rx) = spsc(8);
        let (out_tx, _out_rx) = spsc(8);
        let (mon_tx, _mon_rx) = spsc(8);
        let repo = Arc::new(Repository::new(4, 1));
        let worker = Worker::new(cfg(0), rx, out_tx, mon_tx, repo.clone());

        tx.try_push(signal(2, Punctuation::MovingOut)).unwrap();
        tx.try_push(eos()).unwrap();
        worker.run().unwrap();

        let w = repo.take(2).expect("empty window parked");
        assert!(w.is_empty());
    }

    #[test]
    fn test_moving_in_buffers_and_replays() {
        let (tx, rx) = spsc(32);
        let (out_tx, out_rx) = spsc(32);
        let (mon_tx, _mon_rx) = spsc(8);
        let repo = Arc::new(Repository::new(4, 2));

        // The claimer sees MOVING_IN and two data tuples before the donor
        // parks the window.
        repo.set_finished(1, false);
        tx.try_push(signal(3, Punctuation::MovingIn)).unwrap();
        tx.try_push(data(3, 10)).unwrap();
        tx.try_push(data(3, 11)).unwrap();

        let repo2 = repo.clone();
        let handle = std::thread::spawn(move || {
            let worker = Worker::new(cfg(1), rx, out_tx, mon_tx, repo2);
            worker.run().unwrap();
        });

        // Donor parks a window that is one insert away from a trigger.
        std::thread::sleep(Duration::from_millis(20));
        let mut donated = CountWindow::new(4, 2);
        donated.insert(data(3, 9));
        repo.donate(3, donated);

        std::thread::sleep(Duration::from_millis(50));
        tx.try_push(eos()).unwrap();
        handle.join().unwrap();

        assert!(repo.finished(1));
        // Replay continues the donated cadence: trigger at 10, not 11.
        let mut ids = Vec::new();
        while let Some(msg) = out_rx.try_pop() {
            if let ResultMsg::Result(r) = msg {
                ids.push(r.internal_id);
            }
        }
        assert_eq!(ids, vec![10]);
    }

    #[test]
    fn test_eos_waits_for_pending_claims() {
        let (tx, rx) = spsc(8);
        let (out_tx, out_rx) = spsc(8);
        let (mon_tx, _mon_rx) = spsc(8);
        let repo = Arc::new(Repository::new(4, 2));
        repo.set_finished(0, false);

        tx.try_push(signal(1, Punctuation::MovingIn)).unwrap();
        tx.try_push(eos()).unwrap();

        let repo2 = repo.clone();
        let handle = std::thread::spawn(move || {
            Worker::new(cfg(0), rx, out_tx, mon_tx, repo2).run().unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished(), "worker must wait for the claim");
        repo.donate(1, CountWindow::new(4, 2));
        handle.join().unwrap();
        assert!(repo.finished(0));
        assert!(matches!(out_rx.try_pop(), Some(ResultMsg::Eos { worker: 0 })));
    }

    #[test]
    fn test_testing_tuples_produce_no_results() {
        let (tx, rx) = spsc(16);
        let (out_tx, out_rx) = spsc(16);
        let (mon_tx, _mon_rx) = spsc(8);
        let repo = Arc::new(Repository::new(4, 1));
        let worker = Worker::new(cfg(0), rx, out_tx, mon_tx, repo);

        for _ in 0..4 {
            tx.try_push(signal(0, Punctuation::Testing)).unwrap();
        }
        tx.try_push(eos()).unwrap();
        worker.run().unwrap();

        while let Some(msg) = out_rx.try_pop() {
            assert!(matches!(msg, ResultMsg::Eos { .. }));
        }
    }
}
