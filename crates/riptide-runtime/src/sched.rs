//! Key-to-worker scheduling tables.
//!
//! The table is indexed by key; entry 0 means unassigned, entry `w + 1` means
//! worker `w`. The routing stage owns the one live table and lazily assigns
//! unseen keys round-robin; the controller works on snapshot copies and
//! proposes replacements built here.
//!
//! Two builders are provided. [`compute_full_rebalance`] is LPT greedy and
//! produces the best balance regardless of churn. [`compute_incremental`]
//! starts from the current table and moves as few keys as possible, which
//! keeps migration traffic low during parallelism changes.

/// Per-key routing table. Entries are `worker + 1`, 0 when unassigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingTable {
    entries: Vec<usize>,
}

impl SchedulingTable {
    pub fn new(num_keys: usize) -> Self {
        Self {
            entries: vec![0; num_keys],
        }
    }

    pub fn worker_of(&self, key: usize) -> Option<usize> {
        match self.entries[key] {
            0 => None,
            w => Some(w - 1),
        }
    }

    pub fn assign(&mut self, key: usize, worker: usize) {
        self.entries[key] = worker + 1;
    }

    pub fn clear(&mut self, key: usize) {
        self.entries[key] = 0;
    }

    pub fn num_keys(&self) -> usize {
        self.entries.len()
    }

    pub fn keys_of(&self, worker: usize) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, &e)| e == worker + 1)
            .map(|(k, _)| k)
    }

    /// Keys whose assignment differs between `self` (old) and `new`, as
    /// `(key, old_worker, new_worker)`. Keys unassigned on either side are
    /// skipped; they carry no window state to move.
    pub fn migrations(&self, new: &SchedulingTable) -> Vec<(usize, usize, usize)> {
        self.entries
            .iter()
            .zip(&new.entries)
            .enumerate()
            .filter_map(|(key, (&old, &newe))| match (old, newe) {
                (o, n) if o != 0 && n != 0 && o != n => Some((key, o - 1, n - 1)),
                _ => None,
            })
            .collect()
    }

    fn loads(&self, weights: &[f64], num_workers: usize) -> Vec<f64> {
        let mut loads = vec![0.0; num_workers];
        for (key, &e) in self.entries.iter().enumerate() {
            if e != 0 && e - 1 < num_workers {
                loads[e - 1] += weights[key];
            }
        }
        loads
    }
}

/// Longest-processing-time greedy: keys sorted by weight descending, each
/// placed on the currently least-loaded worker. Keys with zero weight keep
/// their old assignment when it still points at a live worker.
pub fn compute_full_rebalance(
    old: &SchedulingTable,
    weights: &[f64],
    num_workers: usize,
) -> SchedulingTable {
    let mut table = SchedulingTable::new(old.num_keys());
    let mut loads = vec![0.0f64; num_workers];

    let mut keys: Vec<usize> = (0..weights.len()).filter(|&k| weights[k] > 0.0).collect();
    keys.sort_by(|&a, &b| {
        weights[b]
            .partial_cmp(&weights[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for key in keys {
        let target = least_loaded(&loads);
        table.assign(key, target);
        loads[target] += weights[key];
    }
    // Seen-but-idle keys stay where they are if possible.
    for key in 0..old.num_keys() {
        if table.worker_of(key).is_none() {
            if let Some(w) = old.worker_of(key) {
                table.assign(key, if w < num_workers { w } else { least_loaded(&loads) });
            }
        }
    }
    table
}

/// Incremental rebalance: evacuate workers being removed, then repeatedly move
/// the heaviest non-worsening key from the most loaded to the least loaded
/// worker while the imbalance exceeds 10% and the maximum sits above the mean.
pub fn compute_incremental(
    old: &SchedulingTable,
    weights: &[f64],
    num_workers: usize,
) -> SchedulingTable {
    const IMBALANCE_THRESHOLD: f64 = 1.10;

    let mut table = old.clone();
    let mut loads = table.loads(weights, num_workers);

    // Keys stranded on removed workers go to the least loaded survivor.
    for key in 0..table.num_keys() {
        if let Some(w) = table.worker_of(key) {
            if w >= num_workers {
                let target = least_loaded(&loads);
                table.assign(key, target);
                loads[target] += weights[key];
            }
        }
    }

    loop {
        let max_w = most_loaded(&loads);
        let min_w = least_loaded(&loads);
        let (max_load, min_load) = (loads[max_w], loads[min_w]);
        let avg = loads.iter().sum::<f64>() / num_workers as f64;

        let unbalanced = min_load == 0.0
            || (max_load / min_load > IMBALANCE_THRESHOLD && max_load > avg);
        if !unbalanced || max_w == min_w {
            break;
        }

        // Heaviest key on the max worker whose move strictly improves the
        // max/min ratio.
        let mut candidate: Option<(usize, f64)> = None;
        for key in table.keys_of(max_w).collect::<Vec<_>>() {
            let w = weights[key];
            if w <= 0.0 || w >= max_load {
                continue;
            }
            let improves = if min_load == 0.0 {
                true
            } else {
                (w + min_load) / (max_load - w) < max_load / min_load
            };
            if improves && candidate.map_or(true, |(_, best)| w > best) {
                candidate = Some((key, w));
            }
        }
        let Some((key, w)) = candidate else { break };
        table.assign(key, min_w);
        loads[max_w] -= w;
        loads[min_w] += w;
    }
    table
}

fn least_loaded(loads: &[f64]) -> usize {
    let mut best = 0;
    for (i, &l) in loads.iter().enumerate() {
        if l < loads[best] {
            best = i;
        }
    }
    best
}

fn most_loaded(loads: &[f64]) -> usize {
    let mut best = 0;
    for (i, &l) in loads.iter().enumerate() {
        if l > loads[best] {
            best = i;
        }
    }
    best
}
