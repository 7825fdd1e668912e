//! Configuration files.
//!
//! Strategy descriptors are plain `key = value` files with `#` comments.
//! Voltage tables map `(cores, frequency)` pairs to core voltages and use
//! semicolon-separated rows.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// A parsed `key = value` file.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str_named(&text, path)
    }

    /// Parse file contents. Blank lines and lines starting with `#` are
    /// skipped; anything else must be `key = value`.
    pub fn from_str_named(text: &str, path: &Path) -> ConfigResult<Self> {
        let mut entries = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    content: raw.to_string(),
                });
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(ConfigError::MalformedLine {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    content: raw.to_string(),
                });
            }
            entries.insert(key.to_string(), value.to_string());
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Fetch and parse a required key.
    pub fn require<T: FromStr>(&self, key: &'static str) -> ConfigResult<T> {
        let value = self.get(key).ok_or(ConfigError::MissingKey(key))?;
        value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// Which adaptation strategy drives the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Monitoring only, no reconfigurations.
    None,
    /// Predictive search over parallelism.
    Latency,
    /// Predictive search over parallelism and CPU frequency.
    LatencyEnergy,
    /// Threshold hysteresis on observed latency.
    LatencyRule,
    /// Reactive level climbing driven by congestion and throughput.
    Tpds,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::None => "none",
            StrategyKind::Latency => "latency",
            StrategyKind::LatencyEnergy => "latency_energy",
            StrategyKind::LatencyRule => "latency_rule",
            StrategyKind::Tpds => "tpds",
        };
        f.write_str(name)
    }
}

/// Parsed strategy configuration. Each kind has its own required keys; a
/// missing key is a hard error at startup, not a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub kind: StrategyKind,
    /// Control step length in milliseconds.
    pub control_step_ms: u64,
    /// Latency weight in the search objective.
    pub alpha: f64,
    /// Resource/power weight in the search objective.
    pub beta: f64,
    /// Reconfiguration-amplitude weight in the search objective.
    pub gamma: f64,
    /// Number of future control steps the predictive search looks at.
    pub horizon: usize,
    /// Response-time threshold in milliseconds.
    pub threshold_ms: f64,
    /// Highest level the reactive strategy may climb to.
    pub max_level: usize,
    /// In [0, 1]; higher values react to smaller load changes.
    pub change_sensitivity: f64,
    /// Fraction of stalled send time that counts as congestion.
    pub cong_threshold: f64,
}

impl StrategyDescriptor {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let conf = Configuration::from_file(path)?;
        Self::from_configuration(&conf)
    }

    pub fn from_configuration(conf: &Configuration) -> ConfigResult<Self> {
        let name = conf.get("strategy").ok_or(ConfigError::MissingKey("strategy"))?;
        let kind = match name {
            "none" => StrategyKind::None,
            "latency" => StrategyKind::Latency,
            "latency_energy" => StrategyKind::LatencyEnergy,
            "latency_rule" => StrategyKind::LatencyRule,
            "tpds" => StrategyKind::Tpds,
            other => return Err(ConfigError::UnknownStrategy(other.to_string())),
        };

        let mut desc = StrategyDescriptor {
            kind,
            control_step_ms: 1000,
            alpha: 0.0,
            beta: 0.0,
            gamma: 0.0,
            horizon: 1,
            threshold_ms: 0.0,
            max_level: 0,
            change_sensitivity: 0.0,
            cong_threshold: 0.0,
        };

        if kind != StrategyKind::None || conf.get("control_step").is_some() {
            desc.control_step_ms = conf.require("control_step")?;
        }
        match kind {
            StrategyKind::None => {}
            StrategyKind::Latency | StrategyKind::LatencyEnergy => {
                desc.alpha = conf.require("alpha")?;
                desc.beta = conf.require("beta")?;
                desc.gamma = conf.require("gamma")?;
                desc.horizon = conf.require("horizon")?;
                desc.threshold_ms = conf.require("threshold")?;
            }
            StrategyKind::LatencyRule => {
                desc.threshold_ms = conf.require("threshold")?;
            }
            StrategyKind::Tpds => {
                desc.max_level = conf.require("max_level")?;
                desc.change_sensitivity = conf.require("change_sensitivity")?;
                desc.cong_threshold = conf.require("cong_threshold")?;
            }
        }
        Ok(desc)
    }
}

/// Voltage table: `(cores, frequency_khz) -> voltage`.
///
/// Rows are `cores;frequency;voltage`, one per line, `#` comments allowed.
#[derive(Debug, Clone, Default)]
pub struct VoltageTable {
    entries: BTreeMap<(usize, u64), f64>,
}

impl VoltageTable {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut entries = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let malformed = || ConfigError::MalformedLine {
                path: path.to_path_buf(),
                line: idx + 1,
                content: raw.to_string(),
            };
            let mut fields = line.split(';');
            let cores: usize = fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .ok_or_else(malformed)?;
            let freq: u64 = fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .ok_or_else(malformed)?;
            let voltage: f64 = fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .ok_or_else(malformed)?;
            entries.insert((cores, freq), voltage);
        }
        Ok(Self { entries })
    }

    pub fn voltage(&self, cores: usize, freq_khz: u64) -> Option<f64> {
        self.entries.get(&(cores, freq_khz)).copied()
    }

    /// Distinct frequencies in the table, ascending.
    pub fn frequencies(&self) -> Vec<u64> {
        let mut freqs: Vec<u64> = self.entries.keys().map(|&(_, f)| f).collect();
        freqs.sort_unstable();
        freqs.dedup();
        freqs
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
