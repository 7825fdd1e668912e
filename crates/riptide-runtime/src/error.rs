//! Runtime error taxonomy.
//!
//! Errors are grouped by what the operator can do about them: a
//! [`PipelineError::Bottleneck`] means the configuration cannot keep up with
//! the input rate, a [`PipelineError::Protocol`] means a stage broke the
//! reconfiguration handshake, and resource errors mean the host cannot run the
//! requested layout.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A bounded queue stayed full past the backoff budget. The run is not
    /// keeping up; results produced so far are still valid.
    #[error("bottleneck: queue from {from} to {to} full after {retries} retries")]
    Bottleneck {
        from: &'static str,
        to: &'static str,
        retries: usize,
    },

    /// A stage received a message the handshake does not allow at this point.
    #[error("protocol violation in {stage}: expected {expected}, got {got}")]
    Protocol {
        stage: &'static str,
        expected: &'static str,
        got: String,
    },

    /// The collector's out-of-order buffer overflowed. Results would have to
    /// be dropped or emitted out of order, so the run fails loudly instead.
    #[error("reorder buffer overflow for key {key}: {pending} results pending, capacity {capacity}")]
    ReorderOverflow {
        key: i32,
        pending: usize,
        capacity: usize,
    },

    /// A peer hung up in the middle of the handshake.
    #[error("channel to {peer} disconnected")]
    Disconnected { peer: &'static str },

    #[error("insufficient resources: need {needed} cores, have {available}")]
    ResourceExhausted { needed: usize, available: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] riptide_core::ConfigError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
