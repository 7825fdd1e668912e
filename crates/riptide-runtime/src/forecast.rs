//! Arrival-rate forecasting.
//!
//! The predictive strategies size the pipeline against the rate they expect
//! over the next few control steps, not the rate just observed. The forecaster
//! is a seam: the default is a short simple moving average, with a
//! double-exponential (Holt) alternative for drifting loads. Multi-step
//! forecasts feed each prediction back in as if it had been observed.

pub trait Forecaster: Send {
    fn observe(&mut self, value: f64);

    /// Forecast `steps` ahead, `steps >= 1`. Must not disturb observed state.
    fn forecast(&self, steps: usize) -> f64;
}

/// Simple moving average over the last `window` observations.
#[derive(Debug, Clone)]
pub struct SmaForecaster {
    window: usize,
    samples: Vec<f64>,
}

impl SmaForecaster {
    pub const DEFAULT_WINDOW: usize = 3;

    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: Vec::new(),
        }
    }
}

impl Default for SmaForecaster {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

impl Forecaster for SmaForecaster {
    fn observe(&mut self, value: f64) {
        self.samples.push(value);
        if self.samples.len() > self.window {
            self.samples.remove(0);
        }
    }

    fn forecast(&self, steps: usize) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut hypo = self.samples.clone();
        let mut prediction = 0.0;
        for _ in 0..steps.max(1) {
            prediction = hypo.iter().sum::<f64>() / hypo.len() as f64;
            hypo.push(prediction);
            if hypo.len() > self.window {
                hypo.remove(0);
            }
        }
        prediction
    }
}

/// Holt double-exponential smoothing: tracks level and trend.
#[derive(Debug, Clone)]
pub struct HoltWintersForecaster {
    alpha: f64,
    beta: f64,
    level: f64,
    trend: f64,
    seen: u32,
}

impl HoltWintersForecaster {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            level: 0.0,
            trend: 0.0,
            seen: 0,
        }
    }
}

impl Forecaster for HoltWintersForecaster {
    fn observe(&mut self, value: f64) {
        match self.seen {
            0 => self.level = value,
            1 => {
                self.trend = value - self.level;
                self.level = value;
            }
            _ => {
                let prev_level = self.level;
                self.level = self.alpha * value + (1.0 - self.alpha) * (self.level + self.trend);
                self.trend = self.beta * (self.level - prev_level) + (1.0 - self.beta) * self.trend;
            }
        }
        self.seen = self.seen.saturating_add(1);
    }

    fn forecast(&self, steps: usize) -> f64 {
        if self.seen == 0 {
            return 0.0;
        }
        (self.level + steps.max(1) as f64 * self.trend).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_constant_series() {
        let mut f = SmaForecaster::default();
        for _ in 0..5 {
            f.observe(10.0);
        }
        assert!((f.forecast(1) - 10.0).abs() < 1e-9);
        assert!((f.forecast(4) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sma_window_bound() {
        let mut f = SmaForecaster::new(3);
        for v in [100.0, 1.0, 2.0, 3.0] {
            f.observe(v);
        }
        // The 100.0 fell out of the window.
        assert!((f.forecast(1) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_sma_recursive_horizon() {
        let mut f = SmaForecaster::new(3);
        for v in [1.0, 2.0, 3.0] {
            f.observe(v);
        }
        // step 1: mean(1,2,3)=2; step 2: mean(2,3,2)=2.333...
        assert!((f.forecast(2) - 7.0 / 3.0).abs() < 1e-9);
        // forecast is pure; observed state unchanged
        assert!((f.forecast(1) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_holt_tracks_trend() {
        let mut f = HoltWintersForecaster::new(0.8, 0.5);
        for i in 0..10 {
            f.observe(10.0 + 2.0 * i as f64);
        }
        let one = f.forecast(1);
        let three = f.forecast(3);
        assert!(one > 27.0, "level+trend should pass the last sample, got {one}");
        assert!(three > one);
    }

    #[test]
    fn test_empty_forecast_is_zero() {
        let f = SmaForecaster::default();
        assert_eq!(f.forecast(1), 0.0);
        let h = HoltWintersForecaster::new(0.5, 0.5);
        assert_eq!(h.forecast(2), 0.0);
    }
}
