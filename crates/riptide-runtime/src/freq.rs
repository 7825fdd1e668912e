//! Frequency scaling and energy measurement seams.
//!
//! The controller talks to the hardware only through these traits. Real DVFS
//! and RAPL-style counters live behind them; the defaults record the requested
//! state and measure nothing, which is what tests and unprivileged runs use.

use tracing::debug;

use crate::error::PipelineResult;

pub trait FrequencyDriver: Send {
    /// Available core frequencies in kHz, ascending. Empty means the host
    /// cannot scale and the energy strategy degrades to parallelism only.
    fn available_khz(&self) -> &[u64];

    fn current_khz(&self) -> u64;

    fn set_khz(&mut self, khz: u64) -> PipelineResult<()>;
}

/// Records the requested frequency without touching hardware.
pub struct StaticFrequencyDriver {
    freqs: Vec<u64>,
    current: u64,
}

impl StaticFrequencyDriver {
    pub fn new(mut freqs: Vec<u64>, current: u64) -> Self {
        freqs.sort_unstable();
        freqs.dedup();
        Self { freqs, current }
    }

    /// A driver with one fixed frequency.
    pub fn fixed(khz: u64) -> Self {
        Self::new(vec![khz], khz)
    }
}

impl FrequencyDriver for StaticFrequencyDriver {
    fn available_khz(&self) -> &[u64] {
        &self.freqs
    }

    fn current_khz(&self) -> u64 {
        self.current
    }

    fn set_khz(&mut self, khz: u64) -> PipelineResult<()> {
        debug!(khz, "frequency change recorded");
        self.current = khz;
        Ok(())
    }
}

pub trait EnergyProbe: Send {
    /// Joules consumed since the previous call.
    fn sample_joules(&mut self) -> f64;
}

pub struct NullEnergyProbe;

impl EnergyProbe for NullEnergyProbe {
    fn sample_joules(&mut self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_driver() {
        let mut d = StaticFrequencyDriver::new(vec![2_000_000, 1_000_000, 2_000_000], 2_000_000);
        assert_eq!(d.available_khz(), &[1_000_000, 2_000_000]);
        d.set_khz(1_000_000).unwrap();
        assert_eq!(d.current_khz(), 1_000_000);
    }
}
