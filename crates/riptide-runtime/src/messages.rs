//! Messages exchanged between stages and the controller.
//!
//! Every channel carries one closed enum, so a stage can only ever observe the
//! message kinds its protocol allows. Monitoring samples are plain structs
//! embedded in the report enums; scheduling tables travel as snapshot copies,
//! never as shared references.

use riptide_core::{Tuple, WinResult};

use crate::queue::{QueueReceiver, QueueSender};
use crate::sched::SchedulingTable;

/// Worker to collector. Results are boxed so the queue moves a pointer, not
/// the whole summary.
#[derive(Debug)]
pub enum ResultMsg {
    Result(Box<WinResult>),
    /// The sending worker has drained its state and is gone.
    Eos { worker: usize },
}

/// One control step of routing-stage observations.
#[derive(Debug, Clone)]
pub struct EmitterSample {
    pub elements: u64,
    pub elements_per_class: Vec<u64>,
    /// Snapshot of the live routing table.
    pub table: SchedulingTable,
    /// Mean spacing of window triggers (every slide-th tuple per key), in ms.
    pub trigger_interval_ms: f64,
    pub trigger_interval_std_ms: f64,
    /// Fraction of the step spent stalled on full worker queues exceeded the
    /// configured threshold.
    pub congested: bool,
    /// Inbound backlog is growing; the arrival estimate understates demand.
    pub backlog_growing: bool,
}

#[derive(Debug, Clone)]
pub enum EmitterReport {
    Monitoring(EmitterSample),
    ReconfFinished,
    Eos,
}

#[derive(Debug, Clone)]
pub struct WorkerSample {
    pub worker: usize,
    pub elements: u64,
    pub computations: u64,
    pub elements_per_class: Vec<u64>,
    pub computations_per_class: Vec<u64>,
    /// Total compute time spent per class over the step, microseconds.
    pub tcalc_per_class_us: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum WorkerReport {
    Monitoring(WorkerSample),
    Eos { worker: usize },
}

#[derive(Debug, Clone)]
pub struct CollectorSample {
    pub results: u64,
    pub results_per_class: Vec<u64>,
    pub avg_latency_ms: f64,
    pub lat_95_ms: f64,
    pub lat_99_ms: f64,
    pub max_latency_ms: f64,
    /// Coefficient of variation of inter-result spacing.
    pub c_serv: f64,
}

#[derive(Debug, Clone)]
pub enum CollectorReport {
    Monitoring(CollectorSample),
    ReconfFinished,
    Eos,
}

/// Controller to routing stage. One reconfiguration in flight at a time.
#[derive(Debug)]
pub enum EmitterCommand {
    Reconfigure {
        new_num_workers: usize,
        /// Proposed routing table; the routing stage adopts it as the live one.
        table: SchedulingTable,
        /// Senders for workers that did not exist before this command.
        added_queues: Vec<QueueSender<Tuple>>,
    },
}

/// Controller to collector.
#[derive(Debug)]
pub enum CollectorCommand {
    Grow {
        new_num_workers: usize,
        added_queues: Vec<QueueReceiver<ResultMsg>>,
    },
    /// Shrink: the collector consumes the EOS of each removed worker before
    /// acknowledging.
    Shrink { new_num_workers: usize },
}
