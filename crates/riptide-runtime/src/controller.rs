//! Control loop.
//!
//! Once per control step the controller fuses the latest monitoring samples,
//! refreshes the derived metrics, asks the strategy for a target
//! configuration and, when the target differs from the present one, runs the
//! reconfiguration handshake:
//!
//! 1. spawn or select workers, build the proposed routing table
//! 2. command the collector (queue set changes) and the routing stage
//!    (table switch plus migration signals)
//! 3. wait for both acks and for every worker's repository flag
//!
//! Exactly one reconfiguration is ever in flight. While waiting for an ack,
//! stale monitoring samples on the same channel are absorbed; an EOS means
//! the feed ended with the command still queued, which unwinds the change
//! and ends the run. Any other message is a protocol violation.
//!
//! When the strategy leaves the parallelism alone the controller may still
//! rebalance the table opportunistically if one worker runs hot or the load
//! spread is wide. Rebalances are skipped while the reactive strategy is
//! active and for one step after any reconfiguration.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, info, warn};

use riptide_core::{StrategyDescriptor, StrategyKind, Tuple, KEY_EOS};

use crate::error::{PipelineError, PipelineResult};
use crate::forecast::Forecaster;
use crate::freq::{EnergyProbe, FrequencyDriver};
use crate::messages::{
    CollectorCommand, CollectorReport, CollectorSample, EmitterCommand, EmitterReport,
    EmitterSample, ResultMsg, WorkerReport, WorkerSample,
};
use crate::metrics::DerivedMetrics;
use crate::queue::{QueueReceiver, QueueSender};
use crate::repository::Repository;
use crate::sched::{compute_full_rebalance, compute_incremental};
use crate::stats::{ReconfStats, RunSummary, StatsWriter, StepRow};
use crate::strategy::{StrategyContext, StrategyEngine};

/// A single worker past this utilization triggers an opportunistic rebalance.
pub const MAX_RHO_WORKER: f64 = 1.1;

/// Max/min worker utilization ratio past this triggers a rebalance.
pub const MAX_UNBALANCE_RATIO: f64 = 1.30;

/// Everything needed to bring one more worker online.
pub struct SpawnedWorker {
    pub tuple_tx: QueueSender<Tuple>,
    pub result_rx: QueueReceiver<ResultMsg>,
    pub monitor_rx: QueueReceiver<WorkerReport>,
    pub handle: JoinHandle<PipelineResult<()>>,
}

/// Creates and starts worker `index`, wiring its queues.
pub type WorkerSpawner = Box<dyn FnMut(usize) -> PipelineResult<SpawnedWorker> + Send>;

/// Outcome of waiting for a stage ack: the command was applied, or the stage
/// reported end of stream first because the feed ran out with the command
/// still queued.
enum AckWait {
    Acked,
    StreamEnded,
}

pub struct ControllerConfig {
    pub num_keys: usize,
    pub max_workers: usize,
    pub descriptor: StrategyDescriptor,
    pub stats_path: Option<PathBuf>,
}

pub struct Controller {
    cfg: ControllerConfig,
    emitter_mon: QueueReceiver<EmitterReport>,
    emitter_cmd: QueueSender<EmitterCommand>,
    collector_mon: QueueReceiver<CollectorReport>,
    collector_cmd: QueueSender<CollectorCommand>,
    worker_mons: Vec<QueueReceiver<WorkerReport>>,
    worker_handles: Vec<JoinHandle<PipelineResult<()>>>,
    spawner: WorkerSpawner,
    repo: Arc<Repository>,
    engine: StrategyEngine,
    forecaster: Box<dyn Forecaster>,
    driver: Box<dyn FrequencyDriver>,
    energy: Box<dyn EnergyProbe>,
    metrics: DerivedMetrics,
    worker_samples: Vec<WorkerSample>,
    collector_sample: CollectorSample,
    num_workers: usize,
    monitoring_step: u64,
    last_reconf_step: Option<u64>,
    reconf_stats: ReconfStats,
    total_tuples: u64,
    total_results: u64,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ControllerConfig,
        emitter_mon: QueueReceiver<EmitterReport>,
        emitter_cmd: QueueSender<EmitterCommand>,
        collector_mon: QueueReceiver<CollectorReport>,
        collector_cmd: QueueSender<CollectorCommand>,
        initial_workers: Vec<(QueueReceiver<WorkerReport>, JoinHandle<PipelineResult<()>>)>,
        spawner: WorkerSpawner,
        repo: Arc<Repository>,
        engine: StrategyEngine,
        forecaster: Box<dyn Forecaster>,
        driver: Box<dyn FrequencyDriver>,
        energy: Box<dyn EnergyProbe>,
    ) -> Self {
        let num_keys = cfg.num_keys;
        let num_workers = initial_workers.len();
        let mut worker_mons = Vec::with_capacity(num_workers);
        let mut worker_handles = Vec::with_capacity(num_workers);
        for (mon, handle) in initial_workers {
            worker_mons.push(mon);
            worker_handles.push(handle);
        }
        Self {
            cfg,
            emitter_mon,
            emitter_cmd,
            collector_mon,
            collector_cmd,
            worker_mons,
            worker_handles,
            spawner,
            repo,
            engine,
            forecaster,
            driver,
            energy,
            metrics: DerivedMetrics::new(num_keys),
            worker_samples: (0..num_workers).map(empty_worker_sample(num_keys)).collect(),
            collector_sample: empty_collector_sample(num_keys),
            num_workers,
            monitoring_step: 0,
            last_reconf_step: None,
            reconf_stats: ReconfStats::default(),
            total_tuples: 0,
            total_results: 0,
        }
    }

    pub fn run(mut self) -> PipelineResult<RunSummary> {
        let start = Instant::now();
        let mut stats = match &self.cfg.stats_path {
            Some(path) => Some(StatsWriter::create(path)?),
            None => None,
        };

        loop {
            // The routing stage's report cadence is the step clock.
            let Some(emitter_sample) = self.next_emitter_sample()? else {
                break;
            };
            self.monitoring_step += 1;
            self.absorb_reports()?;

            let worker_samples = self.worker_samples.clone();
            let collector_sample = self.collector_sample.clone();
            self.metrics.update(
                &emitter_sample,
                &worker_samples,
                &collector_sample,
                self.num_workers,
                self.cfg.descriptor.control_step_ms,
            );

            // The backlog hint means the measured spacing understates demand.
            let mut interval = self.metrics.trigger_interval_ms;
            if emitter_sample.backlog_growing && interval > 0.0 {
                interval *= 0.9;
            }
            if interval > 0.0 {
                self.forecaster.observe(1.0 / interval);
            }

            if let Some(out) = stats.as_mut() {
                out.write_row(&StepRow {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    results: self.collector_sample.results,
                    avg_latency_ms: self.collector_sample.avg_latency_ms,
                    lat_95_ms: self.collector_sample.lat_95_ms,
                    num_workers: self.num_workers,
                    freq_khz: self.driver.current_khz(),
                    energy_joules: self.energy.sample_joules(),
                })?;
            }

            // No reconfiguration before at least two full steps of samples.
            if self.monitoring_step <= 1 {
                continue;
            }
            if self.adapt(&emitter_sample)? {
                // The feed ended while a command was in flight; the EOS has
                // already been consumed from the monitoring channel.
                break;
            }
        }

        self.shutdown()?;
        if let Some(out) = stats.as_mut() {
            out.flush()?;
        }
        let summary = RunSummary {
            tuples: self.total_tuples,
            results: self.total_results,
            elapsed_ms: start.elapsed().as_millis() as u64,
            reconf: self.reconf_stats.clone(),
        };
        summary.log();
        Ok(summary)
    }

    /// Block for the next routing-stage report, then drain the channel.
    /// Counts every sample's tuples and keeps the newest; `None` means EOS.
    fn next_emitter_sample(&mut self) -> PipelineResult<Option<EmitterSample>> {
        let mut latest: Option<EmitterSample> = None;
        let mut blocking = true;
        loop {
            let msg = if blocking {
                self.emitter_mon.recv()
            } else {
                match self.emitter_mon.try_pop() {
                    Some(m) => Some(m),
                    None => break,
                }
            };
            blocking = false;
            match msg {
                Some(EmitterReport::Monitoring(sample)) => {
                    self.total_tuples += sample.elements;
                    latest = Some(sample);
                }
                Some(EmitterReport::Eos) => return Ok(None),
                Some(EmitterReport::ReconfFinished) => {
                    return Err(PipelineError::Protocol {
                        stage: "controller",
                        expected: "MONITORING or EOS",
                        got: "RECONF_FINISHED".into(),
                    })
                }
                None => return Err(PipelineError::Disconnected { peer: "emitter" }),
            }
        }
        match latest {
            Some(sample) => Ok(Some(sample)),
            None => Err(PipelineError::Disconnected { peer: "emitter" }),
        }
    }

    /// Pick up the freshest worker and collector samples without blocking.
    /// Stream-end sign-offs can race ahead of the routing stage's EOS; they
    /// are left for shutdown to account for.
    fn absorb_reports(&mut self) -> PipelineResult<()> {
        for i in 0..self.worker_mons.len() {
            while let Some(report) = self.worker_mons[i].try_pop() {
                match report {
                    WorkerReport::Monitoring(sample) => self.worker_samples[i] = sample,
                    WorkerReport::Eos { worker } => {
                        debug!(worker, "early worker sign-off noted");
                    }
                }
            }
        }
        while let Some(report) = self.collector_mon.try_pop() {
            match report {
                CollectorReport::Monitoring(sample) => {
                    self.total_results += sample.results;
                    self.collector_sample = sample;
                }
                CollectorReport::Eos => {
                    debug!("early collector sign-off noted");
                }
                CollectorReport::ReconfFinished => {
                    return Err(PipelineError::Protocol {
                        stage: "controller",
                        expected: "MONITORING",
                        got: "RECONF_FINISHED".into(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Returns `true` when the stream ended during an in-flight command.
    fn adapt(&mut self, emitter_sample: &EmitterSample) -> PipelineResult<bool> {
        let horizon = self.cfg.descriptor.horizon.max(1);
        let rate_forecast: Vec<f64> = (1..=horizon)
            .map(|s| self.forecaster.forecast(s))
            .collect();
        let throughput =
            self.collector_sample.results as f64 / (self.cfg.descriptor.control_step_ms as f64 / 1000.0);

        let decision = self.engine.decide(&StrategyContext {
            num_workers: self.num_workers,
            max_workers: self.cfg.max_workers,
            freq_khz: self.driver.current_khz(),
            available_freqs: self.driver.available_khz(),
            tcalc_ms: self.metrics.module_tcalc_ms,
            c_arr: self.metrics.c_arr,
            c_serv: self.metrics.c_serv,
            rate_forecast: &rate_forecast,
            avg_latency_ms: self.collector_sample.avg_latency_ms,
            congested: emitter_sample.congested,
            throughput,
        });
        let n_opt = decision.num_workers.clamp(1, self.cfg.max_workers);

        if n_opt != self.num_workers {
            if self.reconfigure(n_opt, emitter_sample)? {
                return Ok(true);
            }
            if decision.freq_khz != self.driver.current_khz() {
                self.driver.set_khz(decision.freq_khz)?;
                self.reconf_stats.frequency_changes += 1;
            }
            return Ok(false);
        }
        if decision.freq_khz != self.driver.current_khz() {
            info!(khz = decision.freq_khz, "frequency-only change");
            self.driver.set_khz(decision.freq_khz)?;
            self.reconf_stats.frequency_changes += 1;
            return Ok(false);
        }
        self.maybe_rebalance(emitter_sample)
    }

    /// Load-triggered table rebuild at unchanged parallelism.
    fn maybe_rebalance(&mut self, emitter_sample: &EmitterSample) -> PipelineResult<bool> {
        if self.engine.kind() == StrategyKind::Tpds {
            return Ok(false);
        }
        if let Some(last) = self.last_reconf_step {
            // One-step cooldown after any reconfiguration.
            if self.monitoring_step - last <= 1 {
                return Ok(false);
            }
        }
        let rho_max = self.metrics.rho_max();
        let rho_min = self.metrics.rho_min();
        let unbalanced = rho_max > MAX_RHO_WORKER
            || (rho_min > 0.0 && rho_max / rho_min > MAX_UNBALANCE_RATIO);
        if !unbalanced {
            return Ok(false);
        }

        let weights = self.metrics.key_weights(&emitter_sample.elements_per_class);
        let table = compute_full_rebalance(&emitter_sample.table, &weights, self.num_workers);
        let moves = emitter_sample.table.migrations(&table);
        if moves.is_empty() {
            return Ok(false);
        }
        debug!(moves = moves.len(), rho_max, "rebalancing");

        let started = Instant::now();
        self.emitter_cmd
            .push_blocking(EmitterCommand::Reconfigure {
                new_num_workers: self.num_workers,
                table,
                added_queues: Vec::new(),
            })
            .map_err(|_| PipelineError::Disconnected { peer: "emitter" })?;
        match self.await_emitter_ack()? {
            AckWait::Acked => {}
            AckWait::StreamEnded => {
                info!("stream ended before the rebalance was applied");
                return Ok(true);
            }
        }
        self.repo.wait_all_finished();
        self.last_reconf_step = Some(self.monitoring_step);
        self.reconf_stats
            .record(moves.len(), started.elapsed().as_micros() as u64, false);
        Ok(false)
    }

    /// Returns `true` when the stream ended before the command was applied.
    fn reconfigure(&mut self, new_n: usize, emitter_sample: &EmitterSample) -> PipelineResult<bool> {
        let old_n = self.num_workers;
        info!(from = old_n, to = new_n, "changing parallelism");
        let started = Instant::now();

        let weights = self.metrics.key_weights(&emitter_sample.elements_per_class);
        let table = compute_incremental(&emitter_sample.table, &weights, new_n);
        let moves = emitter_sample.table.migrations(&table);

        let mut added_queues = Vec::new();
        if new_n > old_n {
            let mut added_results = Vec::new();
            for idx in old_n..new_n {
                let spawned = (self.spawner)(idx)?;
                added_queues.push(spawned.tuple_tx);
                added_results.push(spawned.result_rx);
                self.worker_mons.push(spawned.monitor_rx);
                self.worker_handles.push(spawned.handle);
                self.worker_samples
                    .push(empty_worker_sample(self.cfg.num_keys)(idx));
            }
            self.collector_cmd
                .push_blocking(CollectorCommand::Grow {
                    new_num_workers: new_n,
                    added_queues: added_results,
                })
                .map_err(|_| PipelineError::Disconnected { peer: "collector" })?;
        } else {
            self.collector_cmd
                .push_blocking(CollectorCommand::Shrink {
                    new_num_workers: new_n,
                })
                .map_err(|_| PipelineError::Disconnected { peer: "collector" })?;
        }

        // Clones of the new tuple queues: if the feed ends before the routing
        // stage applies the command, the spawned workers still need an EOS.
        let added_backup = added_queues.clone();

        self.emitter_cmd
            .push_blocking(EmitterCommand::Reconfigure {
                new_num_workers: new_n,
                table,
                added_queues,
            })
            .map_err(|_| PipelineError::Disconnected { peer: "emitter" })?;

        if let AckWait::StreamEnded = self.await_emitter_ack()? {
            return self.abort_reconfigure(added_backup);
        }
        match self.await_collector_ack()? {
            AckWait::Acked => {}
            AckWait::StreamEnded => {
                // The routing stage applied the command, so the collector must
                // ack before it can see every worker's sign-off.
                return Err(PipelineError::Protocol {
                    stage: "controller",
                    expected: "RECONF_FINISHED",
                    got: "EOS".into(),
                });
            }
        }
        self.repo.wait_all_finished();

        if new_n < old_n {
            // Removed workers have drained; collect them.
            for handle in self.worker_handles.drain(new_n..) {
                join_worker(handle)?;
            }
            self.worker_mons.truncate(new_n);
            self.worker_samples.truncate(new_n);
        }

        self.num_workers = new_n;
        self.last_reconf_step = Some(self.monitoring_step);
        self.reconf_stats
            .record(moves.len(), started.elapsed().as_micros() as u64, true);
        Ok(false)
    }

    /// The feed ended with the parallelism change still queued: the routing
    /// stage never adopted the new table and already sent EOS to the live
    /// worker set. Workers spawned for the change have processed nothing;
    /// an EOS drains them, and shutdown joins them with everyone else.
    fn abort_reconfigure(&mut self, added_queues: Vec<QueueSender<Tuple>>) -> PipelineResult<bool> {
        info!("stream ended before the parallelism change was applied");
        for q in &added_queues {
            let _ = q.push_blocking(Tuple {
                key: KEY_EOS,
                ..Default::default()
            });
        }
        // The collector did get its command; either the ack or its own
        // sign-off can arrive here.
        let _ = self.await_collector_ack()?;
        self.repo.wait_all_finished();
        Ok(true)
    }

    fn await_emitter_ack(&mut self) -> PipelineResult<AckWait> {
        loop {
            match self.emitter_mon.recv() {
                Some(EmitterReport::ReconfFinished) => return Ok(AckWait::Acked),
                // Samples queued before the command are stale, but their
                // tuple counts still belong in the totals.
                Some(EmitterReport::Monitoring(sample)) => {
                    self.total_tuples += sample.elements;
                }
                Some(EmitterReport::Eos) => return Ok(AckWait::StreamEnded),
                None => return Err(PipelineError::Disconnected { peer: "emitter" }),
            }
        }
    }

    fn await_collector_ack(&mut self) -> PipelineResult<AckWait> {
        loop {
            match self.collector_mon.recv() {
                Some(CollectorReport::ReconfFinished) => return Ok(AckWait::Acked),
                Some(CollectorReport::Monitoring(sample)) => {
                    self.total_results += sample.results;
                    self.collector_sample = sample;
                }
                Some(CollectorReport::Eos) => return Ok(AckWait::StreamEnded),
                None => return Err(PipelineError::Disconnected { peer: "collector" }),
            }
        }
    }

    /// Stream end: wait for every worker's sign-off, then the collector's.
    fn shutdown(&mut self) -> PipelineResult<()> {
        for mon in &self.worker_mons {
            loop {
                match mon.recv() {
                    Some(WorkerReport::Monitoring(_)) => continue,
                    Some(WorkerReport::Eos { worker }) => {
                        debug!(worker, "worker EOS acknowledged");
                        break;
                    }
                    None => break,
                }
            }
        }
        for handle in self.worker_handles.drain(..) {
            join_worker(handle)?;
        }
        loop {
            match self.collector_mon.recv() {
                Some(CollectorReport::Monitoring(sample)) => {
                    self.total_results += sample.results;
                    self.collector_sample = sample;
                }
                Some(CollectorReport::Eos) => break,
                Some(CollectorReport::ReconfFinished) => {
                    return Err(PipelineError::Protocol {
                        stage: "controller",
                        expected: "MONITORING or EOS",
                        got: "RECONF_FINISHED".into(),
                    })
                }
                None => break,
            }
        }
        Ok(())
    }
}

fn join_worker(handle: JoinHandle<PipelineResult<()>>) -> PipelineResult<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => {
            warn!("worker thread panicked");
            Err(PipelineError::Disconnected { peer: "worker" })
        }
    }
}

fn empty_worker_sample(num_keys: usize) -> impl Fn(usize) -> WorkerSample {
    move |worker| WorkerSample {
        worker,
        elements: 0,
        computations: 0,
        elements_per_class: vec![0; num_keys],
        computations_per_class: vec![0; num_keys],
        tcalc_per_class_us: vec![0.0; num_keys],
    }
}

fn empty_collector_sample(num_keys: usize) -> CollectorSample {
    CollectorSample {
        results: 0,
        results_per_class: vec![0; num_keys],
        avg_latency_ms: 0.0,
        lat_95_ms: 0.0,
        lat_99_ms: 0.0,
        max_latency_ms: 0.0,
        c_serv: 0.0,
    }
}
