//! Elastic sliding-window pipeline runtime.
//!
//! A run is three kinds of stage threads plus a control loop:
//!
//! - [`emitter`]: pulls quotes from a [`source`], stamps them and routes by
//!   key through the live scheduling table
//! - [`worker`]: per-key count windows, quadratic fit and candle per slide,
//!   migration via in-band signal tuples and the [`repository`] rendezvous
//! - [`collector`]: restores per-key result order and keeps output statistics
//! - [`controller`]: fuses monitoring samples once per control step and drives
//!   the adaptation [`strategy`], worker elasticity and table rebalancing
//!
//! [`pipeline::run`] wires all of it together.

pub mod clock;
pub mod collector;
pub mod controller;
pub mod emitter;
pub mod error;
pub mod forecast;
pub mod freq;
pub mod messages;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod sched;
pub mod source;
pub mod stats;
pub mod strategy;
pub mod window;
pub mod worker;

pub use clock::PipelineClock;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{run, run_with_sink, PipelineConfig, PipelineOutcome};
pub use queue::{spsc, QueueReceiver, QueueSender};
pub use source::{SocketSource, TupleSource, VecSource};
pub use stats::RunSummary;
