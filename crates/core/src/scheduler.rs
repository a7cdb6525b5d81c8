//! Worker-pool sizing and batch dispatch

use crate::config::Policy;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const LOW_MEMORY_BYTES: u64 = 1 << 30;
const HIGH_MEMORY_BYTES: u64 = 8 << 30;

/// Throughput achieved with a given worker count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub workers: usize,
    pub files: usize,
    pub elapsed: Duration,
}

impl ThroughputSample {
    pub fn new(workers: usize, files: usize, elapsed: Duration) -> Self {
        Self {
            workers,
            files,
            elapsed,
        }
    }

    pub fn files_per_second(&self) -> f64 {
        self.files as f64 / self.elapsed.as_secs_f64().max(1e-6)
    }
}

/// Rolling window of the most recent throughput samples
#[derive(Debug, Clone)]
pub struct ThroughputHistory {
    window: usize,
    samples: VecDeque<ThroughputSample>,
}

impl ThroughputHistory {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn push(&mut self, sample: ThroughputSample) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThroughputSample> {
        self.samples.iter()
    }

    pub fn has_tried(&self, workers: usize) -> bool {
        self.samples.iter().any(|s| s.workers == workers)
    }

    /// Worker count with the best mean files/second, ties to fewer workers
    pub fn best_workers(&self) -> Option<usize> {
        let mut by_workers: HashMap<usize, (f64, usize)> = HashMap::new();
        for sample in &self.samples {
            let entry = by_workers.entry(sample.workers).or_insert((0.0, 0));
            entry.0 += sample.files_per_second();
            entry.1 += 1;
        }

        by_workers
            .into_iter()
            .map(|(workers, (sum, n))| (workers, sum / n as f64))
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(workers, _)| workers)
    }
}

/// Worker count and per-worker batch size for the next wave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub workers: usize,
    pub batch_size: usize,
}

impl Plan {
    /// Files dispatched in one wave
    pub fn wave_size(&self) -> usize {
        self.workers * self.batch_size
    }
}

/// Choose workers and batch size for `file_count` remaining files
///
/// Without history a CPU/memory heuristic is used. With history the best
/// recorded worker count wins, except that an untried neighbour of it is
/// explored first.
pub fn plan(
    file_count: usize,
    available_memory: Option<u64>,
    history: &ThroughputHistory,
    policy: &Policy,
) -> Plan {
    let limits = policy.limits();
    let cap = worker_cap(file_count, available_memory, limits.max_workers);

    let workers = match history.best_workers() {
        None => heuristic_workers(file_count, available_memory, cpu_count()),
        Some(best) => climb(best, history, cap),
    }
    .clamp(1, cap);

    let batch_size = batch_size(file_count, workers, limits.min_batch_size, limits.max_batch_size);
    debug!(file_count, workers, batch_size, "Planned wave");

    Plan {
        workers,
        batch_size,
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn worker_cap(file_count: usize, available_memory: Option<u64>, max_workers: usize) -> usize {
    let mut cap = max_workers.min(file_count).max(1);
    if matches!(available_memory, Some(bytes) if bytes < LOW_MEMORY_BYTES) {
        cap = (cap / 2).max(1);
    }
    cap
}

fn heuristic_workers(file_count: usize, available_memory: Option<u64>, cpus: usize) -> usize {
    let mut workers = if file_count < 100 {
        (cpus / 2).max(1)
    } else if file_count < 1000 {
        cpus
    } else {
        (cpus * 2).min(16)
    };

    match available_memory {
        Some(bytes) if bytes < LOW_MEMORY_BYTES => workers = (workers / 2).max(1),
        Some(bytes) if bytes > HIGH_MEMORY_BYTES => workers += 2,
        _ => {}
    }
    workers
}

fn climb(best: usize, history: &ThroughputHistory, cap: usize) -> usize {
    let up = best + 1;
    if up <= cap && !history.has_tried(up) {
        return up;
    }
    if best > 1 && !history.has_tried(best - 1) {
        return best - 1;
    }
    best
}

fn batch_size(file_count: usize, workers: usize, min: usize, max: usize) -> usize {
    file_count.div_ceil(workers.max(1)).clamp(min, max)
}

/// Rayon pools keyed by size, built on first use
#[derive(Default)]
pub struct WorkerPools {
    pools: Mutex<HashMap<usize, Arc<ThreadPool>>>,
}

impl WorkerPools {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, workers: usize) -> Option<Arc<ThreadPool>> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(&workers) {
            return Some(Arc::clone(pool));
        }

        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("importaudit-worker-{}", i))
            .build()
        {
            Ok(pool) => {
                let pool = Arc::new(pool);
                pools.insert(workers, Arc::clone(&pool));
                Some(pool)
            }
            Err(e) => {
                warn!("Failed to build {}-thread pool, using the global pool: {}", workers, e);
                None
            }
        }
    }

    /// Run `job` over `batch_size` chunks of `items` on a pool of `plan.workers`
    ///
    /// Results come back in chunk order.
    pub fn dispatch<T, R, F>(&self, plan: Plan, items: &[T], job: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&[T]) -> R + Sync,
    {
        let batch = plan.batch_size.max(1);
        match self.pool(plan.workers) {
            Some(pool) => pool.install(|| items.par_chunks(batch).map(&job).collect()),
            None => items.par_chunks(batch).map(&job).collect(),
        }
    }
}
