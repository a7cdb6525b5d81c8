//! Session resource tracking: deadline, memory samples, operation timings
//! and per-wave throughput.

use crate::cache::ResultCache;
use crate::config::Policy;
use crate::models::{AbortReason, CacheStats, PerformanceReport, TimingStats, WaveSummary};
use crate::scheduler::{ThroughputHistory, ThroughputSample};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Wall-clock bound shared by the orchestrator and every worker
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn new(start: Instant, limit: Duration) -> Self {
        Self { start, limit }
    }

    /// A zero limit is expired from the start
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.limit
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.start.elapsed())
    }
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
    last: Duration,
}

impl Accumulator {
    fn new(duration: Duration) -> Self {
        Self {
            count: 1,
            total: duration,
            min: duration,
            max: duration,
            last: duration,
        }
    }

    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
        self.last = duration;
    }

    fn merge(&mut self, other: &Accumulator) {
        self.count += other.count;
        self.total += other.total;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.last = other.last;
    }

    fn stats(&self) -> TimingStats {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        TimingStats {
            count: self.count,
            total_ms: ms(self.total),
            min_ms: ms(self.min),
            max_ms: ms(self.max),
            mean_ms: ms(self.total) / self.count as f64,
            last_ms: ms(self.last),
        }
    }
}

/// Per-name duration statistics
///
/// Workers keep their own copy and the session merges them at batch joins.
#[derive(Debug, Clone, Default)]
pub struct OperationTimings {
    ops: BTreeMap<String, Accumulator>,
}

impl OperationTimings {
    pub fn record(&mut self, name: &str, duration: Duration) {
        match self.ops.get_mut(name) {
            Some(acc) => acc.record(duration),
            None => {
                self.ops.insert(name.to_string(), Accumulator::new(duration));
            }
        }
    }

    /// Run `f` and record how long it took under `name`
    pub fn time<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let result = f();
        self.record(name, started.elapsed());
        result
    }

    pub fn merge(&mut self, other: &OperationTimings) {
        for (name, acc) in &other.ops {
            match self.ops.get_mut(name) {
                Some(existing) => existing.merge(acc),
                None => {
                    self.ops.insert(name.clone(), *acc);
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<TimingStats> {
        self.ops.get(name).map(Accumulator::stats)
    }

    pub fn stats(&self) -> BTreeMap<String, TimingStats> {
        self.ops
            .iter()
            .map(|(name, acc)| (name.clone(), acc.stats()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    samples: usize,
    last: u64,
    peak: u64,
    reclaims: usize,
    /// Consecutive samples still over the ceiling after a reclaim
    over_ceiling: usize,
    /// Sample that used up the last reclaim attempt
    exceeded: Option<u64>,
}

/// Memory sampling shared by the workers of one wave
///
/// Every `memory_check_interval` files the worker finishing that file
/// samples resident memory. Over the ceiling it reclaims and samples
/// again. Once the reclaim attempts are used up every worker stops taking
/// new files.
#[derive(Debug)]
pub struct MemoryWatch {
    interval: usize,
    ceiling: u64,
    max_attempts: usize,
    files: AtomicUsize,
    exceeded: AtomicBool,
    state: Mutex<MemoryState>,
}

impl MemoryWatch {
    /// Count one finished file, sampling memory when the interval is reached
    pub fn file_done<K: Eq + Hash + Clone, V: Clone>(&self, cache: &ResultCache<K, V>) {
        let files = self.files.fetch_add(1, Ordering::Relaxed) + 1;
        if files % self.interval != 0 {
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.exceeded.is_some() {
            return;
        }
        if self.take_sample(&mut state) <= self.ceiling {
            state.over_ceiling = 0;
            return;
        }

        release_memory(cache);
        state.reclaims += 1;
        let sample = self.take_sample(&mut state);
        if sample <= self.ceiling {
            state.over_ceiling = 0;
            return;
        }

        state.over_ceiling += 1;
        warn!(
            sample_bytes = sample,
            limit_bytes = self.ceiling,
            attempt = state.over_ceiling,
            "Memory over ceiling after reclaim"
        );
        if state.over_ceiling >= self.max_attempts {
            state.exceeded = Some(sample);
            self.exceeded.store(true, Ordering::Release);
        }
    }

    fn take_sample(&self, state: &mut MemoryState) -> u64 {
        let sample = current_rss_bytes();
        state.samples += 1;
        state.last = sample;
        state.peak = state.peak.max(sample);
        sample
    }

    /// Whether workers should stop taking new files
    pub fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Acquire)
    }

    pub fn samples(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).samples
    }
}

/// Tracks one session's time, memory and throughput
pub struct ResourceMonitor {
    deadline: Deadline,
    max_memory_bytes: u64,
    gc_threshold: usize,
    memory_check_interval: usize,
    max_reclaim_attempts: usize,

    files_processed: usize,
    files_since_reclaim: usize,
    files_since_sample: usize,
    last_memory: u64,
    peak_memory: u64,
    reclaims: usize,
    over_ceiling: usize,

    timings: OperationTimings,
    open_timers: HashMap<String, Instant>,
    history: ThroughputHistory,
    waves: Vec<WaveSummary>,
}

impl ResourceMonitor {
    pub fn new(policy: &Policy) -> Self {
        Self::starting_at(Instant::now(), policy)
    }

    pub fn starting_at(start: Instant, policy: &Policy) -> Self {
        let limits = policy.limits();
        Self {
            deadline: Deadline::new(start, policy.scan_duration()),
            max_memory_bytes: limits.max_memory_bytes,
            gc_threshold: limits.gc_threshold,
            memory_check_interval: limits.memory_check_interval,
            max_reclaim_attempts: limits.max_reclaim_attempts,
            files_processed: 0,
            files_since_reclaim: 0,
            files_since_sample: 0,
            last_memory: 0,
            peak_memory: 0,
            reclaims: 0,
            over_ceiling: 0,
            timings: OperationTimings::default(),
            open_timers: HashMap::new(),
            history: ThroughputHistory::new(limits.history_window),
            waves: Vec::new(),
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.deadline.start.elapsed()
    }

    /// Abort signal once the scan duration is used up
    pub fn check_deadline(&self) -> Result<(), AbortReason> {
        if self.deadline.expired() {
            Err(AbortReason::DeadlineExceeded {
                limit_ms: self.deadline.limit().as_millis() as u64,
            })
        } else {
            Ok(())
        }
    }

    pub fn start_timer(&mut self, name: &str) {
        self.open_timers.insert(name.to_string(), Instant::now());
    }

    /// Stop the timer started under `name` and record its duration
    pub fn end_timer(&mut self, name: &str) -> Option<Duration> {
        let started = self.open_timers.remove(name)?;
        let duration = started.elapsed();
        self.timings.record(name, duration);
        Some(duration)
    }

    /// Fold worker-local timings in
    pub fn merge_timings(&mut self, timings: &OperationTimings) {
        self.timings.merge(timings);
    }

    pub fn timings(&self) -> &OperationTimings {
        &self.timings
    }

    pub fn record_files(&mut self, count: usize) {
        self.files_processed += count;
        self.files_since_reclaim += count;
    }

    pub fn files_processed(&self) -> usize {
        self.files_processed
    }

    pub fn should_reclaim_memory(&self) -> bool {
        self.files_since_reclaim >= self.gc_threshold
    }

    /// Best-effort memory release: drop expired cache entries and return
    /// freed heap pages to the OS where the allocator supports it
    pub fn reclaim<K: Eq + Hash + Clone, V: Clone>(&mut self, cache: &ResultCache<K, V>) -> usize {
        let purged = release_memory(cache);
        self.reclaims += 1;
        self.files_since_reclaim = 0;
        debug!(purged, reclaims = self.reclaims, "Reclaimed memory");
        purged
    }

    pub fn reclaims(&self) -> usize {
        self.reclaims
    }

    /// Memory checks for the workers of the next wave
    ///
    /// The sampling cadence and the count of consecutive over-ceiling
    /// samples carry over from earlier waves.
    pub fn memory_watch(&self) -> MemoryWatch {
        MemoryWatch {
            interval: self.memory_check_interval,
            ceiling: self.max_memory_bytes,
            max_attempts: self.max_reclaim_attempts,
            files: AtomicUsize::new(self.files_since_sample),
            exceeded: AtomicBool::new(false),
            state: Mutex::new(MemoryState {
                over_ceiling: self.over_ceiling,
                ..MemoryState::default()
            }),
        }
    }

    /// Fold in what a wave's workers sampled
    ///
    /// Fails once `max_reclaim_attempts` consecutive samples stayed over the
    /// ceiling after reclaiming.
    pub fn absorb_memory(&mut self, watch: MemoryWatch) -> Result<(), AbortReason> {
        let files = watch.files.into_inner();
        let state = watch.state.into_inner().unwrap_or_else(PoisonError::into_inner);

        self.files_since_sample = files % self.memory_check_interval;
        if state.samples > 0 {
            self.last_memory = state.last;
        }
        self.peak_memory = self.peak_memory.max(state.peak);
        self.reclaims += state.reclaims;
        self.over_ceiling = state.over_ceiling;

        match state.exceeded {
            Some(sample_bytes) => Err(AbortReason::MemoryCeilingExceeded {
                sample_bytes,
                limit_bytes: self.max_memory_bytes,
            }),
            None => Ok(()),
        }
    }

    pub fn last_memory(&self) -> u64 {
        self.last_memory
    }

    pub fn peak_memory(&self) -> u64 {
        self.peak_memory.max(peak_rss_bytes())
    }

    /// Record the throughput achieved by one wave of batches
    pub fn record_wave(&mut self, workers: usize, batch_size: usize, files: usize, elapsed: Duration) {
        let sample = ThroughputSample::new(workers, files, elapsed);
        self.waves.push(WaveSummary {
            workers,
            batch_size,
            files,
            files_per_second: sample.files_per_second(),
        });
        self.history.push(sample);
    }

    pub fn history(&self) -> &ThroughputHistory {
        &self.history
    }

    pub fn performance_report(&self, cache: CacheStats) -> PerformanceReport {
        PerformanceReport {
            cache,
            memory_bytes: self.last_memory,
            peak_memory_bytes: self.peak_memory(),
            reclaims: self.reclaims,
            timings: self.timings.stats(),
            waves: self.waves.clone(),
        }
    }
}

/// Resident set size of this process, 0 when it cannot be measured
pub fn current_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Some(bytes) = statm_rss_bytes() {
            return bytes;
        }
    }
    peak_rss_bytes()
}

#[cfg(target_os = "linux")]
fn statm_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident.saturating_mul(page_size()?))
}

#[cfg(target_os = "linux")]
fn page_size() -> Option<u64> {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    (size > 0).then_some(size as u64)
}

/// Peak resident set size (high-water mark) via `getrusage`
#[cfg(unix)]
pub fn peak_rss_bytes() -> u64 {
    // SAFETY: zeroed rusage is valid, and we handle error return.
    let max_rss = unsafe {
        let mut ru: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut ru) != 0 {
            return 0;
        }
        ru.ru_maxrss
    };
    let max_rss = if max_rss <= 0 { 0 } else { max_rss as u64 };

    // ru_maxrss is in bytes on macOS and KiB elsewhere
    if cfg!(target_os = "macos") {
        max_rss
    } else {
        max_rss.saturating_mul(1024)
    }
}

#[cfg(not(unix))]
pub fn peak_rss_bytes() -> u64 {
    0
}

/// Free physical memory, when the platform reports it
#[cfg(target_os = "linux")]
pub fn available_memory_bytes() -> Option<u64> {
    // SAFETY: sysconf has no preconditions
    let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    if pages <= 0 {
        return None;
    }
    Some((pages as u64).saturating_mul(page_size()?))
}

#[cfg(not(target_os = "linux"))]
pub fn available_memory_bytes() -> Option<u64> {
    None
}

/// Drop expired cache entries and hand freed heap pages back to the OS
fn release_memory<K: Eq + Hash + Clone, V: Clone>(cache: &ResultCache<K, V>) -> usize {
    let purged = cache.purge_expired();
    trim_heap();
    purged
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_heap() {
    // SAFETY: malloc_trim only releases free heap pages
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_heap() {}
