//! Routing stage.
//!
//! Pulls quotes from the source, stamps them with the pipeline timestamp and
//! the per-key arrival counter, and forwards each to the worker the live
//! scheduling table names. Unseen keys are assigned round-robin on first
//! sight. This stage is the only writer of the live table; the controller
//! only ever sees snapshot copies and proposes replacements.
//!
//! A reconfiguration command is executed as one atomic sequence between two
//! data tuples: first every MOVING_OUT signal to the donors, then every
//! MOVING_IN to the claimers, then EOS to workers being removed, then the
//! proposed table becomes the live one. Worker queues are FIFO, so every
//! worker observes its signals before any post-switch data.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use riptide_core::{Punctuation, Tuple};

use crate::clock::PipelineClock;
use crate::error::{PipelineError, PipelineResult};
use crate::messages::{EmitterCommand, EmitterReport, EmitterSample};
use crate::metrics::RunningStat;
use crate::queue::{PushError, QueueReceiver, QueueSender};
use crate::repository::Repository;
use crate::sched::SchedulingTable;
use crate::source::TupleSource;

/// Inbound backlog above this many tuples counts as growing pressure.
const BACKLOG_HINT_THRESHOLD: usize = 1000;

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub num_keys: usize,
    pub window_slide: usize,
    pub control_step: std::time::Duration,
    /// Fraction of stalled sends per step that counts as congestion.
    pub cong_threshold: f64,
    /// Spin retries per send before declaring a bottleneck.
    pub retry_budget: usize,
}

pub struct Emitter<S: TupleSource> {
    cfg: EmitterConfig,
    source: S,
    workers: Vec<QueueSender<Tuple>>,
    commands: QueueReceiver<EmitterCommand>,
    monitor: QueueSender<EmitterReport>,
    repo: Arc<Repository>,
    table: SchedulingTable,
    next_rr: usize,
    internal_ids: Vec<i64>,
    clock: PipelineClock,
    counters: StepCounters,
    last_backlog: usize,
}

struct StepCounters {
    elements: u64,
    elements_per_class: Vec<u64>,
    trigger_spacing: RunningStat,
    last_trigger: Option<Instant>,
    stalled_sends: u64,
}

impl StepCounters {
    fn new(num_keys: usize) -> Self {
        Self {
            elements: 0,
            elements_per_class: vec![0; num_keys],
            trigger_spacing: RunningStat::default(),
            last_trigger: None,
            stalled_sends: 0,
        }
    }

    fn reset(&mut self) {
        self.elements = 0;
        self.elements_per_class.iter_mut().for_each(|c| *c = 0);
        self.trigger_spacing.reset();
        self.stalled_sends = 0;
    }
}

impl<S: TupleSource> Emitter<S> {
    pub fn new(
        cfg: EmitterConfig,
        source: S,
        workers: Vec<QueueSender<Tuple>>,
        commands: QueueReceiver<EmitterCommand>,
        monitor: QueueSender<EmitterReport>,
        repo: Arc<Repository>,
        clock: PipelineClock,
    ) -> Self {
        let num_keys = cfg.num_keys;
        Self {
            cfg,
            source,
            workers,
            commands,
            monitor,
            repo,
            table: SchedulingTable::new(num_keys),
            next_rr: 0,
            internal_ids: vec![0; num_keys],
            clock,
            counters: StepCounters::new(num_keys),
            last_backlog: 0,
        }
    }

    pub fn run(mut self) -> PipelineResult<()> {
        let mut last_report = Instant::now();
        loop {
            // Commands are handled between tuples; at most one is ever
            // outstanding.
            if let Some(cmd) = self.commands.try_pop() {
                self.reconfigure(cmd)?;
            }

            match self.source.next()? {
                Some(t) if t.is_sync() => {
                    self.clock.synchronize();
                    info!("time origin synchronized");
                }
                Some(t) if t.is_eos() => return self.finish(),
                None => {
                    warn!("feed closed without EOS sentinel");
                    return self.finish();
                }
                Some(t) => self.route(t)?,
            }

            if last_report.elapsed() >= self.cfg.control_step {
                self.report();
                last_report = Instant::now();
            }
        }
    }

    fn route(&mut self, mut tuple: Tuple) -> PipelineResult<()> {
        // The key comes straight off the wire; a feed bug must not take the
        // stage down.
        if tuple.key < 0 || tuple.key as usize >= self.cfg.num_keys {
            warn!(key = tuple.key, "dropping tuple with out-of-range key");
            return Ok(());
        }
        let key = tuple.key as usize;
        tuple.timestamp = self.clock.now_us();
        tuple.internal_id = self.internal_ids[key];
        self.internal_ids[key] += 1;

        let worker = match self.table.worker_of(key) {
            Some(w) => w,
            None => {
                let w = self.next_rr % self.workers.len();
                self.next_rr += 1;
                self.table.assign(key, w);
                w
            }
        };

        self.counters.elements += 1;
        self.counters.elements_per_class[key] += 1;
        if tuple.internal_id % self.cfg.window_slide as i64 == self.cfg.window_slide as i64 - 1 {
            let now = Instant::now();
            if let Some(prev) = self.counters.last_trigger.replace(now) {
                self.counters
                    .trigger_spacing
                    .push(now.duration_since(prev).as_secs_f64() * 1e3);
            }
        }

        match self.workers[worker].push_backoff(tuple, self.cfg.retry_budget) {
            Ok(0) => Ok(()),
            Ok(_) => {
                self.counters.stalled_sends += 1;
                Ok(())
            }
            Err(PushError::Full(_)) => Err(PipelineError::Bottleneck {
                from: "emitter",
                to: "worker",
                retries: self.cfg.retry_budget,
            }),
            Err(PushError::Closed(_)) => Err(PipelineError::Disconnected { peer: "worker" }),
        }
    }

    fn reconfigure(&mut self, cmd: EmitterCommand) -> PipelineResult<()> {
        let EmitterCommand::Reconfigure {
            new_num_workers,
            table,
            added_queues,
        } = cmd;
        self.workers.extend(added_queues);

        let moves = self.table.migrations(&table);
        debug!(
            workers = new_num_workers,
            moves = moves.len(),
            "applying reconfiguration"
        );

        // Claimers must not be considered done until their windows land.
        for &(_, _, to) in &moves {
            self.repo.set_finished(to, false);
        }
        // All donations signalled before any claim.
        for &(key, from, _) in &moves {
            self.signal(from, key, Punctuation::MovingOut)?;
        }
        for &(key, _, to) in &moves {
            self.signal(to, key, Punctuation::MovingIn)?;
        }

        // Removed workers get EOS after their donation signals.
        if new_num_workers < self.workers.len() {
            for w in new_num_workers..self.workers.len() {
                let eos = Tuple {
                    key: riptide_core::KEY_EOS,
                    ..Default::default()
                };
                self.workers[w]
                    .push_blocking(eos)
                    .map_err(|_| PipelineError::Disconnected { peer: "worker" })?;
            }
            self.workers.truncate(new_num_workers);
        }

        self.table = table;
        self.monitor
            .push_blocking(EmitterReport::ReconfFinished)
            .map_err(|_| PipelineError::Disconnected { peer: "controller" })?;
        Ok(())
    }

    fn signal(&self, worker: usize, key: usize, punctuation: Punctuation) -> PipelineResult<()> {
        let tuple = Tuple {
            key: key as i32,
            punctuation,
            ..Default::default()
        };
        self.workers[worker]
            .push_blocking(tuple)
            .map_err(|_| PipelineError::Disconnected { peer: "worker" })
    }

    fn report(&mut self) {
        let congested = self.counters.elements > 0
            && self.cfg.cong_threshold > 0.0
            && self.counters.stalled_sends as f64 / self.counters.elements as f64
                > self.cfg.cong_threshold;
        let backlog = self.source.backlog().unwrap_or(0);
        let backlog_growing = backlog > BACKLOG_HINT_THRESHOLD && backlog > self.last_backlog;
        self.last_backlog = backlog;

        let sample = EmitterSample {
            elements: self.counters.elements,
            elements_per_class: self.counters.elements_per_class.clone(),
            table: self.table.clone(),
            trigger_interval_ms: self.counters.trigger_spacing.mean(),
            trigger_interval_std_ms: self.counters.trigger_spacing.std_dev(),
            congested,
            backlog_growing,
        };
        let _ = self.monitor.try_push(EmitterReport::Monitoring(sample));
        self.counters.reset();
    }

    fn finish(mut self) -> PipelineResult<()> {
        // A command posted just as the feed ended is still binding; the
        // controller blocks on its ack, so execute it before signing off.
        while let Some(cmd) = self.commands.try_pop() {
            self.reconfigure(cmd)?;
        }
        for w in &self.workers {
            let eos = Tuple {
                key: riptide_core::KEY_EOS,
                ..Default::default()
            };
            w.push_blocking(eos)
                .map_err(|_| PipelineError::Disconnected { peer: "worker" })?;
        }
        self.report();
        let _ = self.monitor.push_blocking(EmitterReport::Eos);
        info!("input drained, EOS propagated");
        Ok(())
    }
}
