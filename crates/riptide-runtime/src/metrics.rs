//! Derived per-step metrics.
//!
//! The controller fuses the raw samples from the three stage families into
//! the quantities the strategies actually consume: per-class and module-level
//! service times, per-worker and module utilization, and the arrival/service
//! variability coefficients of the queueing model.

use crate::messages::{CollectorSample, EmitterSample, WorkerSample};

/// Online mean and standard deviation (Welford).
#[derive(Debug, Clone, Default)]
pub struct RunningStat {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStat {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// Coefficient of variation; zero while the mean is zero.
    pub fn cv(&self) -> f64 {
        if self.mean == 0.0 {
            0.0
        } else {
            self.std_dev() / self.mean
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Module ceiling on utilization used when sizing against a forecast rate.
pub const MAX_RHO_MODULE: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct DerivedMetrics {
    /// Mean compute time per result per class, ms, blended across steps.
    pub tcalc_per_class_ms: Vec<f64>,
    /// Frequency-weighted module service time per result, ms.
    pub module_tcalc_ms: f64,
    /// Busy fraction of each worker over the step.
    pub rho_per_worker: Vec<f64>,
    pub module_rho: f64,
    /// Mean window-trigger spacing, ms.
    pub trigger_interval_ms: f64,
    /// Triggers per millisecond.
    pub arrival_rate: f64,
    pub c_arr: f64,
    pub c_serv: f64,
}

impl DerivedMetrics {
    pub fn new(num_classes: usize) -> Self {
        Self {
            tcalc_per_class_ms: vec![0.0; num_classes],
            module_tcalc_ms: 0.0,
            rho_per_worker: Vec::new(),
            module_rho: 0.0,
            trigger_interval_ms: 0.0,
            arrival_rate: 0.0,
            c_arr: 0.0,
            c_serv: 0.0,
        }
    }

    pub fn update(
        &mut self,
        emitter: &EmitterSample,
        workers: &[WorkerSample],
        collector: &CollectorSample,
        num_workers: usize,
        control_step_ms: u64,
    ) {
        let num_classes = self.tcalc_per_class_ms.len();
        let step_us = control_step_ms as f64 * 1000.0;

        // Per-class service time, blended with the previous step to damp
        // sampling noise.
        for class in 0..num_classes {
            let (mut tcalc_us, mut comps) = (0.0, 0u64);
            for w in workers {
                tcalc_us += w.tcalc_per_class_us[class];
                comps += w.computations_per_class[class];
            }
            if comps > 0 {
                let fresh = tcalc_us / comps as f64 / 1000.0;
                let prev = self.tcalc_per_class_ms[class];
                self.tcalc_per_class_ms[class] = if prev > 0.0 { (prev + fresh) / 2.0 } else { fresh };
            }
        }

        // Module service time weighted by each class's share of the input.
        let total_elems: u64 = emitter.elements_per_class.iter().sum();
        self.module_tcalc_ms = if total_elems == 0 {
            0.0
        } else {
            (0..num_classes)
                .map(|c| {
                    let share = emitter.elements_per_class[c] as f64 / total_elems as f64;
                    share * self.tcalc_per_class_ms[c]
                })
                .sum()
        };

        // Busy fraction per worker.
        self.rho_per_worker = workers
            .iter()
            .map(|w| w.tcalc_per_class_us.iter().sum::<f64>() / step_us)
            .collect();

        self.trigger_interval_ms = emitter.trigger_interval_ms;
        self.arrival_rate = if emitter.trigger_interval_ms > 0.0 {
            1.0 / emitter.trigger_interval_ms
        } else {
            0.0
        };
        self.module_rho = if self.trigger_interval_ms > 0.0 && num_workers > 0 {
            (self.module_tcalc_ms / num_workers as f64) / self.trigger_interval_ms
        } else {
            0.0
        };
        self.c_arr = if emitter.trigger_interval_ms > 0.0 {
            emitter.trigger_interval_std_ms / emitter.trigger_interval_ms
        } else {
            0.0
        };
        self.c_serv = collector.c_serv;
    }

    pub fn rho_max(&self) -> f64 {
        self.rho_per_worker.iter().cloned().fold(0.0, f64::max)
    }

    pub fn rho_min(&self) -> f64 {
        self.rho_per_worker
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min)
    }

    /// Per-key load weights for the scheduling-table builders: class share of
    /// the input times class service time.
    pub fn key_weights(&self, elements_per_class: &[u64]) -> Vec<f64> {
        elements_per_class
            .iter()
            .zip(&self.tcalc_per_class_ms)
            .map(|(&n, &t)| {
                let t = if t > 0.0 { t } else { 1.0 };
                n as f64 * t
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedulingTable;

    fn emitter_sample(per_class: Vec<u64>, interval_ms: f64, std_ms: f64) -> EmitterSample {
        EmitterSample {
            elements: per_class.iter().sum(),
            elements_per_class: per_class.clone(),
            table: SchedulingTable::new(per_class.len()),
            trigger_interval_ms: interval_ms,
            trigger_interval_std_ms: std_ms,
            congested: false,
            backlog_growing: false,
        }
    }

    fn worker_sample(worker: usize, tcalc_us: Vec<f64>, comps: Vec<u64>) -> WorkerSample {
        WorkerSample {
            worker,
            elements: comps.iter().sum(),
            computations: comps.iter().sum(),
            elements_per_class: comps.clone(),
            computations_per_class: comps,
            tcalc_per_class_us: tcalc_us,
        }
    }

    fn collector_sample(c_serv: f64) -> CollectorSample {
        CollectorSample {
            results: 0,
            results_per_class: vec![],
            avg_latency_ms: 0.0,
            lat_95_ms: 0.0,
            lat_99_ms: 0.0,
            max_latency_ms: 0.0,
            c_serv,
        }
    }

    #[test]
    fn test_running_stat() {
        let mut s = RunningStat::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.push(v);
        }
        assert!((s.mean() - 5.0).abs() < 1e-9);
        assert!((s.std_dev() - 2.138089935).abs() < 1e-6);
    }

    #[test]
    fn test_derived_update() {
        let mut m = DerivedMetrics::new(2);
        let e = emitter_sample(vec![600, 400], 0.5, 0.1);
        // Each worker spent half the step computing.
        let workers = vec![
            worker_sample(0, vec![400_000.0, 100_000.0], vec![400, 100]),
            worker_sample(1, vec![200_000.0, 300_000.0], vec![200, 300]),
        ];
        let c = collector_sample(0.7);
        m.update(&e, &workers, &c, 2, 1000);

        // Class 0: 600k us over 600 comps -> 1 ms each.
        assert!((m.tcalc_per_class_ms[0] - 1.0).abs() < 1e-9);
        assert!((m.tcalc_per_class_ms[1] - 1.0).abs() < 1e-9);
        assert!((m.module_tcalc_ms - 1.0).abs() < 1e-9);
        assert!((m.rho_per_worker[0] - 0.5).abs() < 1e-9);
        assert!((m.rho_per_worker[1] - 0.5).abs() < 1e-9);
        // (1.0 / 2) / 0.5 = 1.0
        assert!((m.module_rho - 1.0).abs() < 1e-9);
        assert!((m.c_arr - 0.2).abs() < 1e-9);
        assert_eq!(m.c_serv, 0.7);
        assert!((m.arrival_rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_tcalc_blending() {
        let mut m = DerivedMetrics::new(1);
        let e = emitter_sample(vec![100], 1.0, 0.0);
        let c = collector_sample(0.0);
        let w1 = vec![worker_sample(0, vec![100_000.0], vec![100])];
        m.update(&e, &w1, &c, 1, 1000);
        assert!((m.tcalc_per_class_ms[0] - 1.0).abs() < 1e-9);
        // Second step observes 3 ms; blended to 2 ms.
        let w2 = vec![worker_sample(0, vec![300_000.0], vec![100])];
        m.update(&e, &w2, &c, 1, 1000);
        assert!((m.tcalc_per_class_ms[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_key_weights() {
        let mut m = DerivedMetrics::new(3);
        m.tcalc_per_class_ms = vec![1.0, 2.0, 0.0];
        let w = m.key_weights(&[10, 5, 3]);
        assert_eq!(w, vec![10.0, 10.0, 3.0]);
    }
}
