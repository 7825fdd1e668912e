//! Pipeline assembly.
//!
//! Builds every queue, spawns one pinned OS thread per stage (routing stage,
//! each worker, collector) and runs the controller on the calling thread.
//! Core layout: routing stage on core 0, collector on 1, controller on 2,
//! worker `i` on `3 + i`.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use riptide_core::{ConfigError, StrategyDescriptor, StrategyKind, VoltageTable, WinResult};

use crate::clock::PipelineClock;
use crate::collector::{Collector, CollectorConfig};
use crate::controller::{Controller, ControllerConfig, SpawnedWorker, WorkerSpawner};
use crate::emitter::{Emitter, EmitterConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::forecast::SmaForecaster;
use crate::freq::{NullEnergyProbe, StaticFrequencyDriver};
use crate::queue::{spsc, QueueSender, CONTROL_QUEUE_CAPACITY, DATA_QUEUE_CAPACITY, DEFAULT_RETRY_BUDGET};
use crate::repository::Repository;
use crate::source::TupleSource;
use crate::stats::RunSummary;
use crate::strategy::StrategyEngine;
use crate::worker::{Worker, WorkerConfig};

/// Assumed core clock when no voltage table provides the frequency ladder.
const NOMINAL_FREQ_KHZ: u64 = 2_400_000;

const DEFAULT_REORDER_SLOTS: usize = 5;
const PRINT_RATE_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub num_keys: usize,
    pub initial_workers: usize,
    pub max_workers: usize,
    pub window_size: usize,
    pub window_slide: usize,
    pub descriptor: StrategyDescriptor,
    pub reorder_slots: usize,
    pub queue_capacity: usize,
    pub retry_budget: usize,
    pub stats_path: Option<PathBuf>,
    pub voltage_table: VoltageTable,
    pub pin_cores: bool,
}

impl PipelineConfig {
    pub fn new(
        num_keys: usize,
        initial_workers: usize,
        window_size: usize,
        window_slide: usize,
        descriptor: StrategyDescriptor,
    ) -> Self {
        Self {
            num_keys,
            initial_workers,
            max_workers: initial_workers.max(1) * 4,
            window_size,
            window_slide,
            descriptor,
            reorder_slots: DEFAULT_REORDER_SLOTS,
            queue_capacity: DATA_QUEUE_CAPACITY,
            retry_budget: DEFAULT_RETRY_BUDGET,
            stats_path: None,
            voltage_table: VoltageTable::default(),
            pin_cores: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_slide == 0 || self.window_size % self.window_slide != 0 {
            return Err(ConfigError::WindowGeometry {
                size: self.window_size,
                slide: self.window_slide,
            });
        }
        if self.num_keys == 0 {
            return Err(ConfigError::InvalidValue {
                key: "num_keys".into(),
                value: "0".into(),
            });
        }
        if self.initial_workers == 0 || self.initial_workers > self.max_workers {
            return Err(ConfigError::InvalidValue {
                key: "initial_workers".into(),
                value: self.initial_workers.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub summary: RunSummary,
    pub results: u64,
}

/// Run the pipeline to completion over `source`.
pub fn run<S: TupleSource + 'static>(
    cfg: PipelineConfig,
    source: S,
) -> PipelineResult<PipelineOutcome> {
    run_with_sink(cfg, source, None)
}

/// As [`run`], with an optional downstream consumer for ordered results.
pub fn run_with_sink<S: TupleSource + 'static>(
    cfg: PipelineConfig,
    source: S,
    sink: Option<QueueSender<Box<WinResult>>>,
) -> PipelineResult<PipelineOutcome> {
    cfg.validate()?;

    let cores: Arc<Vec<core_affinity::CoreId>> = Arc::new(if cfg.pin_cores {
        core_affinity::get_core_ids().unwrap_or_default()
    } else {
        Vec::new()
    });
    if cfg.pin_cores {
        let needed = cfg.initial_workers + 3;
        if cores.len() < needed {
            return Err(PipelineError::ResourceExhausted {
                needed,
                available: cores.len(),
            });
        }
    }

    let repo = Arc::new(Repository::new(cfg.num_keys, cfg.max_workers));
    let clock = PipelineClock::new();
    let control_step = std::time::Duration::from_millis(cfg.descriptor.control_step_ms);

    let (emitter_mon_tx, emitter_mon_rx) = spsc(CONTROL_QUEUE_CAPACITY);
    let (emitter_cmd_tx, emitter_cmd_rx) = spsc(CONTROL_QUEUE_CAPACITY);
    let (collector_mon_tx, collector_mon_rx) = spsc(CONTROL_QUEUE_CAPACITY);
    let (collector_cmd_tx, collector_cmd_rx) = spsc(CONTROL_QUEUE_CAPACITY);

    let mut spawner = make_spawner(&cfg, repo.clone(), cores.clone());

    let mut worker_queues = Vec::new();
    let mut result_queues = Vec::new();
    let mut initial_workers = Vec::new();
    for idx in 0..cfg.initial_workers {
        let spawned = spawner(idx)?;
        worker_queues.push(spawned.tuple_tx);
        result_queues.push(spawned.result_rx);
        initial_workers.push((spawned.monitor_rx, spawned.handle));
    }

    let emitter = Emitter::new(
        EmitterConfig {
            num_keys: cfg.num_keys,
            window_slide: cfg.window_slide,
            control_step,
            cong_threshold: match cfg.descriptor.kind {
                StrategyKind::Tpds => cfg.descriptor.cong_threshold,
                _ => 0.0,
            },
            retry_budget: cfg.retry_budget,
        },
        source,
        worker_queues,
        emitter_cmd_rx,
        emitter_mon_tx,
        repo.clone(),
        clock.clone(),
    );
    let emitter_cores = cores.clone();
    let emitter_handle = std::thread::Builder::new()
        .name("riptide-emitter".into())
        .spawn(move || {
            pin_thread("emitter", 0, &emitter_cores);
            emitter.run()
        })?;

    let collector = Collector::new(
        CollectorConfig {
            num_keys: cfg.num_keys,
            window_slide: cfg.window_slide,
            control_step,
            print_rate: std::time::Duration::from_millis(PRINT_RATE_MS),
            reorder_slots: cfg.reorder_slots,
        },
        result_queues,
        collector_cmd_rx,
        collector_mon_tx,
        sink,
        clock.clone(),
    );
    let collector_cores = cores.clone();
    let collector_handle = std::thread::Builder::new()
        .name("riptide-collector".into())
        .spawn(move || {
            pin_thread("collector", 1, &collector_cores);
            collector.run()
        })?;

    pin_thread("controller", 2, &cores);
    let freqs = cfg.voltage_table.frequencies();
    let driver = if freqs.is_empty() {
        StaticFrequencyDriver::fixed(NOMINAL_FREQ_KHZ)
    } else {
        let top = *freqs.last().unwrap_or(&NOMINAL_FREQ_KHZ);
        StaticFrequencyDriver::new(freqs, top)
    };
    let engine = StrategyEngine::new(cfg.descriptor.clone(), cfg.voltage_table.clone());
    let controller = Controller::new(
        ControllerConfig {
            num_keys: cfg.num_keys,
            max_workers: cfg.max_workers,
            descriptor: cfg.descriptor.clone(),
            stats_path: cfg.stats_path.clone(),
        },
        emitter_mon_rx,
        emitter_cmd_tx,
        collector_mon_rx,
        collector_cmd_tx,
        initial_workers,
        spawner,
        repo,
        engine,
        Box::new(SmaForecaster::default()),
        Box::new(driver),
        Box::new(NullEnergyProbe),
    );
    let controller_result = controller.run();

    // A failed stage tears the others down through channel closure; report
    // the root cause, not the cascade.
    let emitter_result = join_stage("emitter", emitter_handle);
    let collector_result = join_stage("collector", collector_handle);
    if let Err(e) = emitter_result {
        return Err(e);
    }
    let results = collector_result?;
    let summary = controller_result?;
    info!(results, "pipeline complete");
    Ok(PipelineOutcome { summary, results })
}

fn make_spawner(
    cfg: &PipelineConfig,
    repo: Arc<Repository>,
    cores: Arc<Vec<core_affinity::CoreId>>,
) -> WorkerSpawner {
    let worker_cfg = WorkerConfig {
        worker: 0,
        num_keys: cfg.num_keys,
        window_size: cfg.window_size,
        window_slide: cfg.window_slide,
        control_step: std::time::Duration::from_millis(cfg.descriptor.control_step_ms),
    };
    let queue_capacity = cfg.queue_capacity;
    Box::new(move |index: usize| -> PipelineResult<SpawnedWorker> {
        let (tuple_tx, tuple_rx) = spsc(queue_capacity);
        let (result_tx, result_rx) = spsc(queue_capacity);
        let (monitor_tx, monitor_rx) = spsc(CONTROL_QUEUE_CAPACITY);
        let worker = Worker::new(
            WorkerConfig {
                worker: index,
                ..worker_cfg.clone()
            },
            tuple_rx,
            result_tx,
            monitor_tx,
            repo.clone(),
        );
        let cores = cores.clone();
        let handle = std::thread::Builder::new()
            .name(format!("riptide-worker-{index}"))
            .spawn(move || {
                pin_thread("worker", 3 + index, &cores);
                worker.run()
            })?;
        Ok(SpawnedWorker {
            tuple_tx,
            result_rx,
            monitor_rx,
            handle,
        })
    })
}

fn pin_thread(name: &str, index: usize, cores: &[core_affinity::CoreId]) {
    if cores.is_empty() {
        return;
    }
    #[cfg(target_os = "linux")]
    {
        let core = cores[index % cores.len()];
        if core_affinity::set_for_current(core) {
            debug!(stage = name, core = core.id, "pinned");
        } else {
            warn!(stage = name, core = core.id, "failed to pin thread");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = index;
        debug!(stage = name, "CPU affinity not applied on this platform");
    }
}

fn join_stage<T>(name: &'static str, handle: std::thread::JoinHandle<PipelineResult<T>>) -> PipelineResult<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => {
            warn!(stage = name, "stage thread panicked");
            Err(PipelineError::Disconnected { peer: name })
        }
    }
}
