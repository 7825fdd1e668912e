//! Core data model and configuration for the riptide pipeline.
//!
//! - [`tuple`]: market quote tuples, window results and the fixed-size wire codec
//! - [`config`]: `key = value` configuration files, strategy descriptors and
//!   voltage tables
//! - [`error`]: configuration error taxonomy

pub mod config;
pub mod error;
pub mod tuple;

pub use config::{Configuration, StrategyDescriptor, StrategyKind, VoltageTable};
pub use error::{ConfigError, ConfigResult};
pub use tuple::{Candle, Punctuation, Tuple, WinResult, KEY_EOS, KEY_SYNC, RECORD_SIZE};
