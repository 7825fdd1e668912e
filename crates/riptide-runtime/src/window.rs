//! Count-based sliding windows.
//!
//! One [`CountWindow`] per key. Inserts are O(1) into a fixed circular buffer
//! of `size` quotes; every `slide` inserts the window becomes computable and
//! [`CountWindow::compute`] summarizes the buffered quotes (quadratic
//! least-squares trend per side plus an OHLC candle over the last slide).
//!
//! Windows are the unit of state migration: during a reconfiguration the whole
//! struct moves between workers through the repository, counters included, so
//! the trigger cadence is preserved across the move.

use riptide_core::{Candle, Tuple, WinResult};

#[derive(Debug, Clone)]
pub struct CountWindow {
    buf: Vec<Tuple>,
    head: usize,
    filled: usize,
    since_trigger: usize,
    total: u64,
    size: usize,
    slide: usize,
    next_window_id: i64,
    last: Tuple,
}

impl CountWindow {
    /// `size` must be a positive multiple of `slide`; validated at startup.
    pub fn new(size: usize, slide: usize) -> Self {
        debug_assert!(slide > 0 && size % slide == 0);
        Self {
            buf: Vec::with_capacity(size),
            head: 0,
            filled: 0,
            since_trigger: 0,
            total: 0,
            size,
            slide,
            next_window_id: 0,
            last: Tuple::default(),
        }
    }

    pub fn insert(&mut self, tuple: Tuple) {
        if self.buf.len() < self.size {
            self.buf.push(tuple);
        } else {
            self.buf[self.head] = tuple;
        }
        self.head = (self.head + 1) % self.size;
        self.filled = (self.filled + 1).min(self.size);
        self.since_trigger += 1;
        self.total += 1;
        self.last = tuple;
    }

    /// True exactly when `slide` quotes arrived since the last compute.
    pub fn is_computable(&self) -> bool {
        self.since_trigger == self.slide
    }

    /// Summarize the window and rearm the trigger. Buffered quotes stay in
    /// place for the next overlapping window.
    pub fn compute(&mut self) -> WinResult {
        self.since_trigger = 0;
        let window_id = self.next_window_id;
        self.next_window_id += 1;

        let n = self.filled;
        let bid: Vec<f64> = self.iter_chrono().map(|t| t.bid_price as f64).collect();
        let ask: Vec<f64> = self.iter_chrono().map(|t| t.ask_price as f64).collect();
        let tail = n.min(self.slide);

        WinResult {
            key: self.last.key,
            internal_id: self.last.internal_id,
            window_id,
            timestamp: self.last.timestamp,
            fit_bid: quad_fit(&bid),
            fit_ask: quad_fit(&ask),
            candle_bid: candle(&bid[n - tail..]),
            candle_ask: candle(&ask[n - tail..]),
        }
    }

    /// Drop all contents and counters. The window behaves as newly created.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.head = 0;
        self.filled = 0;
        self.since_trigger = 0;
        self.total = 0;
        self.next_window_id = 0;
        self.last = Tuple::default();
    }

    pub fn total_elements(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    fn iter_chrono(&self) -> impl Iterator<Item = &Tuple> {
        let oldest = if self.filled < self.size {
            0
        } else {
            self.head
        };
        (0..self.filled).map(move |i| &self.buf[(oldest + i) % self.size])
    }
}

/// Least-squares quadratic `y = c0 + c1 x + c2 x^2` over `y[i]` at `x = i`.
/// Fewer than three points degrade to a flat fit at the mean.
fn quad_fit(y: &[f64]) -> [f64; 3] {
    let n = y.len();
    if n == 0 {
        return [0.0; 3];
    }
    if n < 3 {
        let mean = y.iter().sum::<f64>() / n as f64;
        return [mean, 0.0, 0.0];
    }
    let mut s = [0.0f64; 5];
    let mut b = [0.0f64; 3];
    for (i, &yi) in y.iter().enumerate() {
        let x = i as f64;
        let mut p = 1.0;
        for sk in s.iter_mut() {
            *sk += p;
            p *= x;
        }
        b[0] += yi;
        b[1] += yi * x;
        b[2] += yi * x * x;
    }
    // 3x3 normal equations, Cramer's rule.
    let m = [[s[0], s[1], s[2]], [s[1], s[2], s[3]], [s[2], s[3], s[4]]];
    let det3 = |a: &[[f64; 3]; 3]| {
        a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
            - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
            + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0])
    };
    let d = det3(&m);
    if d.abs() < f64::EPSILON {
        let mean = y.iter().sum::<f64>() / n as f64;
        return [mean, 0.0, 0.0];
    }
    let mut out = [0.0f64; 3];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut mc = m;
        for row in 0..3 {
            mc[row][col] = b[row];
        }
        *slot = det3(&mc) / d;
    }
    out
}

fn candle(y: &[f64]) -> Candle {
    if y.is_empty() {
        return Candle::default();
    }
    let mut high = y[0];
    let mut low = y[0];
    for &v in y {
        high = high.max(v);
        low = low.min(v);
    }
    Candle {
        open: y[0] as f32,
        close: y[y.len() - 1] as f32,
        high: high as f32,
        low: low as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tup(key: i32, internal_id: i64, price: f32) -> Tuple {
        Tuple {
            key,
            internal_id,
            bid_price: price,
            ask_price: price + 0.5,
            timestamp: internal_id * 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_trigger_cadence() {
        let mut w = CountWindow::new(4, 2);
        let mut triggers = Vec::new();
        for i in 0..8 {
            w.insert(tup(1, i, 100.0 + i as f32));
            if w.is_computable() {
                triggers.push(i);
                let r = w.compute();
                assert_eq!(r.internal_id, i);
            }
        }
        assert_eq!(triggers, vec![1, 3, 5, 7]);
        assert_eq!(w.total_elements(), 8);
    }

    #[test]
    fn test_partial_window_uses_available() {
        let mut w = CountWindow::new(8, 2);
        w.insert(tup(3, 0, 10.0));
        w.insert(tup(3, 1, 12.0));
        assert!(w.is_computable());
        let r = w.compute();
        // Two points: flat fit at the mean.
        assert!((r.fit_bid[0] - 11.0).abs() < 1e-9);
        assert_eq!(r.fit_bid[2], 0.0);
        assert_eq!(r.candle_bid.open, 10.0);
        assert_eq!(r.candle_bid.close, 12.0);
    }

    #[test]
    fn test_full_window_keeps_last_size() {
        let mut w = CountWindow::new(4, 4);
        for i in 0..12 {
            w.insert(tup(2, i, i as f32));
            if w.is_computable() {
                w.compute();
            }
        }
        assert_eq!(w.len(), 4);
        // Oldest surviving quote is id 8.
        let oldest: Vec<i64> = w.iter_chrono().map(|t| t.internal_id).collect();
        assert_eq!(oldest, vec![8, 9, 10, 11]);
    }

    #[test]
    fn test_quadratic_recovered() {
        // y = 2 + 3x + 0.5x^2 must be fit exactly.
        let y: Vec<f64> = (0..10).map(|i| 2.0 + 3.0 * i as f64 + 0.5 * (i * i) as f64).collect();
        let c = quad_fit(&y);
        assert!((c[0] - 2.0).abs() < 1e-6);
        assert!((c[1] - 3.0).abs() < 1e-6);
        assert!((c[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_reset() {
        let mut w = CountWindow::new(4, 2);
        w.insert(tup(1, 0, 1.0));
        w.reset();
        assert!(w.is_empty());
        assert_eq!(w.total_elements(), 0);
        assert!(!w.is_computable());
    }

    #[test]
    fn test_candle_ohlc() {
        let c = candle(&[5.0, 9.0, 3.0, 7.0]);
        assert_eq!(c.open, 5.0);
        assert_eq!(c.close, 7.0);
        assert_eq!(c.high, 9.0);
        assert_eq!(c.low, 3.0);
    }

    #[test]
    fn test_migrated_window_keeps_cadence() {
        let mut w = CountWindow::new(4, 2);
        w.insert(tup(1, 0, 1.0));
        // One insert short of a trigger; move the window, then finish.
        let mut moved = w.clone();
        moved.insert(tup(1, 1, 2.0));
        assert!(moved.is_computable());
    }
}
