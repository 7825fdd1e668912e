//! Collector stage.
//!
//! Polls the worker result queues round-robin and restores per-key result
//! order before emitting. Workers are individually FIFO, so a migrated key can
//! produce at most a short burst of out-of-order results around the handover;
//! those sit in a small bounded buffer keyed by the expected internal id. If
//! the buffer overflows, ordering can no longer be guaranteed and the run
//! fails loudly.
//!
//! The collector also keeps the output-side statistics: print-rate throughput
//! lines and the per-control-step latency sample for the controller.

use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use tracing::{debug, info};

use riptide_core::WinResult;

use crate::clock::PipelineClock;
use crate::error::{PipelineError, PipelineResult};
use crate::messages::{CollectorCommand, CollectorReport, CollectorSample, ResultMsg};
use crate::metrics::RunningStat;
use crate::queue::{Poll, QueueReceiver, QueueSender};

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub num_keys: usize,
    pub window_slide: usize,
    pub control_step: Duration,
    pub print_rate: Duration,
    /// Out-of-order slots per key; overflow is a hard error.
    pub reorder_slots: usize,
}

pub struct Collector {
    cfg: CollectorConfig,
    inputs: Vec<QueueReceiver<ResultMsg>>,
    done: Vec<bool>,
    commands: QueueReceiver<CollectorCommand>,
    monitor: QueueSender<CollectorReport>,
    /// Downstream consumer, absent when results are terminal.
    output: Option<QueueSender<Box<WinResult>>>,
    clock: PipelineClock,
    expected: Vec<i64>,
    pending: Vec<Vec<Box<WinResult>>>,
    step: StepCounters,
    total_results: u64,
    print_results: u64,
}

struct StepCounters {
    results: u64,
    results_per_class: Vec<u64>,
    latencies_ms: Vec<f64>,
    inter_result: RunningStat,
    last_result: Option<Instant>,
}

impl StepCounters {
    fn new(num_keys: usize) -> Self {
        Self {
            results: 0,
            results_per_class: vec![0; num_keys],
            latencies_ms: Vec::new(),
            inter_result: RunningStat::default(),
            last_result: None,
        }
    }

    fn reset(&mut self) {
        self.results = 0;
        self.results_per_class.iter_mut().for_each(|c| *c = 0);
        self.latencies_ms.clear();
        self.inter_result.reset();
    }
}

impl Collector {
    pub fn new(
        cfg: CollectorConfig,
        inputs: Vec<QueueReceiver<ResultMsg>>,
        commands: QueueReceiver<CollectorCommand>,
        monitor: QueueSender<CollectorReport>,
        output: Option<QueueSender<Box<WinResult>>>,
        clock: PipelineClock,
    ) -> Self {
        let num_keys = cfg.num_keys;
        let num_workers = inputs.len();
        // First result per key carries the internal id of the slide-th tuple.
        let expected = vec![cfg.window_slide as i64 - 1; num_keys];
        Self {
            cfg,
            inputs,
            done: vec![false; num_workers],
            commands,
            monitor,
            output,
            clock,
            expected,
            pending: (0..num_keys).map(|_| Vec::new()).collect(),
            step: StepCounters::new(num_keys),
            total_results: 0,
            print_results: 0,
        }
    }

    /// Runs until every worker's EOS arrived. Returns the total result count.
    pub fn run(mut self) -> PipelineResult<u64> {
        let backoff = Backoff::new();
        let mut last_report = Instant::now();
        let mut last_print = Instant::now();
        loop {
            if let Some(cmd) = self.commands.try_pop() {
                self.handle_command(cmd)?;
            }

            let mut progressed = false;
            for i in 0..self.inputs.len() {
                if self.done[i] {
                    continue;
                }
                match self.inputs[i].poll() {
                    Poll::Item(ResultMsg::Result(result)) => {
                        self.accept(result)?;
                        progressed = true;
                    }
                    Poll::Item(ResultMsg::Eos { worker }) => {
                        debug!(worker, "worker signed off");
                        self.done[i] = true;
                        progressed = true;
                    }
                    Poll::Closed => {
                        return Err(PipelineError::Disconnected { peer: "worker" });
                    }
                    Poll::Empty => {}
                }
            }

            if self.done.iter().all(|&d| d) {
                return self.finish();
            }

            if progressed {
                backoff.reset();
            } else if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }

            if last_report.elapsed() >= self.cfg.control_step {
                self.report();
                last_report = Instant::now();
            }
            if last_print.elapsed() >= self.cfg.print_rate {
                let secs = last_print.elapsed().as_secs_f64();
                info!(
                    rate = format_args!("{:.0}/s", self.print_results as f64 / secs),
                    total = self.total_results,
                    "output throughput"
                );
                self.print_results = 0;
                last_print = Instant::now();
            }
        }
    }

    /// Order-restoring acceptance.
    fn accept(&mut self, result: Box<WinResult>) -> PipelineResult<()> {
        let key = result.key as usize;
        if result.internal_id == self.expected[key] {
            self.emit(result)?;
            self.expected[key] += self.cfg.window_slide as i64;
            // Anything buffered may now be in sequence.
            loop {
                let next = self.expected[key];
                let Some(pos) = self.pending[key].iter().position(|r| r.internal_id == next)
                else {
                    break;
                };
                let buffered = self.pending[key].swap_remove(pos);
                self.emit(buffered)?;
                self.expected[key] += self.cfg.window_slide as i64;
            }
            Ok(())
        } else {
            self.pending[key].push(result);
            if self.pending[key].len() > self.cfg.reorder_slots {
                return Err(PipelineError::ReorderOverflow {
                    key: key as i32,
                    pending: self.pending[key].len(),
                    capacity: self.cfg.reorder_slots,
                });
            }
            Ok(())
        }
    }

    fn emit(&mut self, result: Box<WinResult>) -> PipelineResult<()> {
        let key = result.key as usize;
        let latency_ms = (self.clock.now_us() - result.timestamp) as f64 / 1e3;
        self.step.results += 1;
        self.step.results_per_class[key] += 1;
        self.step.latencies_ms.push(latency_ms.max(0.0));
        let now = Instant::now();
        if let Some(prev) = self.step.last_result.replace(now) {
            self.step
                .inter_result
                .push(now.duration_since(prev).as_secs_f64() * 1e3);
        }
        self.total_results += 1;
        self.print_results += 1;

        if let Some(out) = &self.output {
            out.push_blocking(result)
                .map_err(|_| PipelineError::Disconnected { peer: "sink" })?;
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: CollectorCommand) -> PipelineResult<()> {
        match cmd {
            CollectorCommand::Grow {
                new_num_workers,
                added_queues,
            } => {
                self.inputs.extend(added_queues);
                self.done.resize(self.inputs.len(), false);
                debug!(workers = new_num_workers, "collector grew");
            }
            CollectorCommand::Shrink { new_num_workers } => {
                // Removed workers still flush their tail; consume up to EOS.
                for i in new_num_workers..self.inputs.len() {
                    loop {
                        match self.inputs[i].recv() {
                            Some(ResultMsg::Result(result)) => self.accept(result)?,
                            Some(ResultMsg::Eos { worker }) => {
                                debug!(worker, "removed worker drained");
                                break;
                            }
                            None => {
                                return Err(PipelineError::Disconnected { peer: "worker" })
                            }
                        }
                    }
                }
                self.inputs.truncate(new_num_workers);
                self.done.truncate(new_num_workers);
                debug!(workers = new_num_workers, "collector shrank");
            }
        }
        self.monitor
            .push_blocking(CollectorReport::ReconfFinished)
            .map_err(|_| PipelineError::Disconnected { peer: "controller" })?;
        Ok(())
    }

    fn report(&mut self) {
        let sample = self.sample();
        let _ = self.monitor.try_push(CollectorReport::Monitoring(sample));
        self.step.reset();
    }

    fn sample(&mut self) -> CollectorSample {
        let lats = &mut self.step.latencies_ms;
        lats.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |lats: &[f64], p: f64| -> f64 {
            if lats.is_empty() {
                return 0.0;
            }
            let idx = ((lats.len() as f64 * p).ceil() as usize).min(lats.len()) - 1;
            lats[idx]
        };
        CollectorSample {
            results: self.step.results,
            results_per_class: self.step.results_per_class.clone(),
            avg_latency_ms: if lats.is_empty() {
                0.0
            } else {
                lats.iter().sum::<f64>() / lats.len() as f64
            },
            lat_95_ms: percentile(lats, 0.95),
            lat_99_ms: percentile(lats, 0.99),
            max_latency_ms: lats.last().copied().unwrap_or(0.0),
            c_serv: self.step.inter_result.cv(),
        }
    }

    fn finish(mut self) -> PipelineResult<u64> {
        // Leftover buffered results mean a gap never closed.
        for key in 0..self.cfg.num_keys {
            if !self.pending[key].is_empty() {
                return Err(PipelineError::ReorderOverflow {
                    key: key as i32,
                    pending: self.pending[key].len(),
                    capacity: self.cfg.reorder_slots,
                });
            }
        }
        self.report();
        let _ = self.monitor.push_blocking(CollectorReport::Eos);
        info!(results = self.total_results, "collector drained");
        Ok(self.total_results)
    }
}
