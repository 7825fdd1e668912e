//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed line {line} in {path}: `{content}`")]
    MalformedLine {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("missing required key `{0}`")]
    MissingKey(&'static str),

    #[error("invalid value for `{key}`: `{value}`")]
    InvalidValue { key: String, value: String },

    #[error("unknown strategy `{0}`")]
    UnknownStrategy(String),

    #[error("window size {size} is not a multiple of slide {slide}")]
    WindowGeometry { size: usize, slide: usize },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
