//! Run statistics.
//!
//! Two outputs: a per-control-step stats file the controller appends to
//! (whitespace-separated columns, one row per step) and an end-of-run summary
//! logged when the pipeline drains.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::error::PipelineResult;

/// One control step as written to the stats file.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepRow {
    pub elapsed_ms: u64,
    pub results: u64,
    pub avg_latency_ms: f64,
    pub lat_95_ms: f64,
    pub num_workers: usize,
    pub freq_khz: u64,
    pub energy_joules: f64,
}

pub struct StatsWriter {
    out: BufWriter<File>,
}

impl StatsWriter {
    pub fn create(path: &Path) -> PipelineResult<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "#elapsed_ms results avg_latency_ms lat_95_ms workers freq_khz energy_j"
        )?;
        Ok(Self { out })
    }

    pub fn write_row(&mut self, row: &StepRow) -> PipelineResult<()> {
        writeln!(
            self.out,
            "{} {} {:.3} {:.3} {} {} {:.3}",
            row.elapsed_ms,
            row.results,
            row.avg_latency_ms,
            row.lat_95_ms,
            row.num_workers,
            row.freq_khz,
            row.energy_joules,
        )?;
        Ok(())
    }

    pub fn flush(&mut self) -> PipelineResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reconfiguration bookkeeping kept by the controller.
#[derive(Debug, Clone, Default)]
pub struct ReconfStats {
    pub reconfigurations: u64,
    pub rebalances: u64,
    pub frequency_changes: u64,
    pub keys_moved: u64,
    pub total_handshake_us: u64,
}

impl ReconfStats {
    pub fn record(&mut self, keys_moved: usize, handshake_us: u64, par_changed: bool) {
        if par_changed {
            self.reconfigurations += 1;
        } else {
            self.rebalances += 1;
        }
        self.keys_moved += keys_moved as u64;
        self.total_handshake_us += handshake_us;
    }
}

/// End-of-run summary.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tuples: u64,
    pub results: u64,
    pub elapsed_ms: u64,
    pub reconf: ReconfStats,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            tuples = self.tuples,
            results = self.results,
            elapsed_ms = self.elapsed_ms,
            reconfigurations = self.reconf.reconfigurations,
            rebalances = self.reconf.rebalances,
            frequency_changes = self.reconf.frequency_changes,
            keys_moved = self.reconf.keys_moved,
            "run complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_file_rows() {
        let dir = std::env::temp_dir().join("riptide_stats_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stats.dat");
        {
            let mut w = StatsWriter::create(&path).unwrap();
            w.write_row(&StepRow {
                elapsed_ms: 1000,
                results: 500,
                avg_latency_ms: 1.25,
                lat_95_ms: 3.5,
                num_workers: 2,
                freq_khz: 2_000_000,
                energy_joules: 0.0,
            })
            .unwrap();
            w.flush().unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with('#'));
        assert_eq!(lines.next().unwrap(), "1000 500 1.250 3.500 2 2000000 0.000");
    }

    #[test]
    fn test_reconf_stats() {
        let mut s = ReconfStats::default();
        s.record(3, 120, true);
        s.record(2, 80, false);
        assert_eq!(s.reconfigurations, 1);
        assert_eq!(s.rebalances, 1);
        assert_eq!(s.keys_moved, 5);
        assert_eq!(s.total_handshake_us, 200);
    }
}
