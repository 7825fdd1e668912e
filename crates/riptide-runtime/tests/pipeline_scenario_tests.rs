//! End-to-end pipeline scenarios over in-memory feeds.
//!
//! Each scenario runs the full stage graph (routing, workers, collector,
//! controller) on real threads and checks the two properties every run must
//! keep: no result is lost and every key's results come out in window order.

use std::time::Duration;

use riptide_core::{
    Configuration, StrategyDescriptor, Tuple, WinResult, KEY_EOS, KEY_SYNC,
};
use riptide_runtime::pipeline::{run_with_sink, PipelineConfig};
use riptide_runtime::source::{TupleSource, VecSource};
use riptide_runtime::{spsc, PipelineError, PipelineResult, QueueReceiver};

// ==========================================================================
// Helpers
// ==========================================================================

fn descriptor(text: &str) -> StrategyDescriptor {
    let conf = Configuration::from_str_named(text, std::path::Path::new("t.conf")).unwrap();
    StrategyDescriptor::from_configuration(&conf).unwrap()
}

fn quote(key: i32, price: f32) -> Tuple {
    Tuple {
        key,
        bid_price: price,
        ask_price: price + 0.5,
        bid_size: 10,
        ask_size: 10,
        ..Default::default()
    }
}

fn sentinel(key: i32) -> Tuple {
    Tuple {
        key,
        ..Default::default()
    }
}

/// Sync sentinel, then `per_key` quotes for each key interleaved round-robin,
/// then EOS.
fn feed(num_keys: i32, per_key: usize) -> Vec<Tuple> {
    let mut tuples = vec![sentinel(KEY_SYNC)];
    for i in 0..per_key {
        for key in 0..num_keys {
            tuples.push(quote(key, 100.0 + i as f32));
        }
    }
    tuples.push(sentinel(KEY_EOS));
    tuples
}

/// In-memory source that paces delivery, so the run spans several control
/// steps instead of draining instantly.
struct PacedSource {
    inner: VecSource,
    delay: Duration,
}

impl TupleSource for PacedSource {
    fn next(&mut self) -> PipelineResult<Option<Tuple>> {
        std::thread::sleep(self.delay);
        self.inner.next()
    }

    fn backlog(&mut self) -> Option<usize> {
        self.inner.backlog()
    }
}

fn drain_per_key(sink: QueueReceiver<Box<WinResult>>, num_keys: usize) -> Vec<Vec<i64>> {
    let mut per_key = vec![Vec::new(); num_keys];
    while let Some(result) = sink.try_pop() {
        per_key[result.key as usize].push(result.internal_id);
    }
    per_key
}

// ==========================================================================
// Steady state
// ==========================================================================

#[test]
fn steady_run_emits_one_result_per_slide_per_key() {
    let desc = descriptor("strategy = none\ncontrol_step = 60000\n");
    let cfg = PipelineConfig::new(4, 1, 4, 2, desc);
    let (sink_tx, sink_rx) = spsc(256);

    let outcome = run_with_sink(cfg, VecSource::new(feed(4, 8)), Some(sink_tx)).unwrap();

    // 8 tuples per key at slide 2: triggers at internal ids 1, 3, 5, 7.
    assert_eq!(outcome.results, 16);
    assert_eq!(outcome.summary.tuples, 32);
    assert_eq!(outcome.summary.reconf.reconfigurations, 0);
    for ids in drain_per_key(sink_rx, 4) {
        assert_eq!(ids, vec![1, 3, 5, 7]);
    }
}

#[test]
fn steady_run_across_multiple_workers() {
    let desc = descriptor("strategy = none\ncontrol_step = 60000\n");
    let cfg = PipelineConfig::new(6, 3, 4, 2, desc);
    let (sink_tx, sink_rx) = spsc(1024);

    let outcome = run_with_sink(cfg, VecSource::new(feed(6, 20)), Some(sink_tx)).unwrap();

    assert_eq!(outcome.results, 6 * 10);
    for ids in drain_per_key(sink_rx, 6) {
        let expected: Vec<i64> = (0..10).map(|i| 2 * i + 1).collect();
        assert_eq!(ids, expected);
    }
}

#[test]
fn shuffled_arrival_order_is_restored_per_key() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    // Interleave keys randomly; each key's own quotes stay in feed order, so
    // the output contract is unchanged.
    let num_keys = 4usize;
    let per_key = 24usize;
    let mut remaining = vec![per_key; num_keys];
    let mut sent = vec![0usize; num_keys];
    let mut rng = StdRng::seed_from_u64(7);
    let mut tuples = vec![sentinel(KEY_SYNC)];
    while remaining.iter().any(|&r| r > 0) {
        let key = rng.gen_range(0..num_keys);
        if remaining[key] == 0 {
            continue;
        }
        tuples.push(quote(key as i32, 100.0 + sent[key] as f32));
        sent[key] += 1;
        remaining[key] -= 1;
    }
    tuples.push(sentinel(KEY_EOS));

    let desc = descriptor("strategy = none\ncontrol_step = 60000\n");
    let cfg = PipelineConfig::new(num_keys, 2, 4, 2, desc);
    let (sink_tx, sink_rx) = spsc(1024);
    let outcome = run_with_sink(cfg, VecSource::new(tuples), Some(sink_tx)).unwrap();

    assert_eq!(outcome.results, (num_keys * per_key / 2) as u64);
    for ids in drain_per_key(sink_rx, num_keys) {
        let expected: Vec<i64> = (0..per_key as i64 / 2).map(|i| 2 * i + 1).collect();
        assert_eq!(ids, expected);
    }
}

// ==========================================================================
// Elasticity
// ==========================================================================

#[test]
fn elastic_run_preserves_order_and_loses_nothing() {
    // The hysteresis rule keeps changing the worker count while the paced
    // feed runs, so several migration handshakes happen mid-stream.
    let desc = descriptor("strategy = latency_rule\ncontrol_step = 40\nthreshold = 0.05\n");
    let mut cfg = PipelineConfig::new(6, 2, 4, 2, desc);
    cfg.max_workers = 3;
    cfg.reorder_slots = 256;
    let (sink_tx, sink_rx) = spsc(2048);

    let source = PacedSource {
        inner: VecSource::new(feed(6, 80)),
        delay: Duration::from_micros(800),
    };
    let outcome = run_with_sink(cfg, source, Some(sink_tx)).unwrap();

    // 80 tuples per key: one result per slide, ids 1, 3, ..., 79.
    assert_eq!(outcome.results, 6 * 40);
    assert_eq!(outcome.summary.tuples, 6 * 80);
    for ids in drain_per_key(sink_rx, 6) {
        let expected: Vec<i64> = (0..40).map(|i| 2 * i + 1).collect();
        assert_eq!(ids, expected);
    }
}

#[test]
fn latency_strategy_grows_past_one_worker_and_loses_nothing() {
    // Predictive search end to end. The resource weight is negative, so once
    // the model has two steps of samples every feasible candidate with more
    // workers costs strictly less and the search must leave one worker.
    let desc = descriptor(
        "strategy = latency\ncontrol_step = 40\nalpha = 1.0\nbeta = -0.5\n\
         gamma = 0.0\nhorizon = 2\nthreshold = 50.0\n",
    );
    let mut cfg = PipelineConfig::new(6, 1, 4, 2, desc);
    cfg.max_workers = 3;
    cfg.reorder_slots = 256;
    let (sink_tx, sink_rx) = spsc(2048);

    let source = PacedSource {
        inner: VecSource::new(feed(6, 80)),
        delay: Duration::from_micros(800),
    };
    let outcome = run_with_sink(cfg, source, Some(sink_tx)).unwrap();

    assert!(
        outcome.summary.reconf.reconfigurations >= 1,
        "never scaled out: {:?}",
        outcome.summary.reconf
    );
    assert_eq!(outcome.results, 6 * 40);
    assert_eq!(outcome.summary.tuples, 6 * 80);
    for ids in drain_per_key(sink_rx, 6) {
        let expected: Vec<i64> = (0..40).map(|i| 2 * i + 1).collect();
        assert_eq!(ids, expected);
    }
}

// ==========================================================================
// Validation
// ==========================================================================

#[test]
fn rejects_window_size_not_multiple_of_slide() {
    let desc = descriptor("strategy = none\n");
    let cfg = PipelineConfig::new(2, 1, 5, 2, desc);
    let err = run_with_sink(cfg, VecSource::new(feed(2, 4)), None).unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[test]
fn rejects_zero_workers() {
    let desc = descriptor("strategy = none\n");
    let cfg = PipelineConfig::new(2, 0, 4, 2, desc);
    assert!(run_with_sink(cfg, VecSource::new(feed(2, 4)), None).is_err());
}
