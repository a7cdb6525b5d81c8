use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Import declarations extracted from a single file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSet {
    /// Module names (top-level only unless the policy says otherwise)
    pub modules: BTreeSet<String>,
    /// Set when the walk stopped at the node limit; `modules` is then partial
    #[serde(default)]
    pub truncated: bool,
    /// Number of syntax nodes visited while collecting
    #[serde(default)]
    pub nodes_visited: usize,
}

impl ImportSet {
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains(module)
    }
}

/// A candidate file discovered during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute path
    pub path: PathBuf,
    /// Path relative to the scan root
    pub relative_path: PathBuf,
    /// Size in bytes at enumeration time
    pub size: u64,
    /// Modification time at enumeration time
    pub modified: SystemTime,
}

/// Why a single file was excluded from the results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RejectionKind {
    PathRejected,
    SizeRejected,
    ContentRejected,
    ImportFlagged,
    ParseFailed,
    ReadFailed,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::PathRejected => "PathRejected",
            RejectionKind::SizeRejected => "SizeRejected",
            RejectionKind::ContentRejected => "ContentRejected",
            RejectionKind::ImportFlagged => "ImportFlagged",
            RejectionKind::ParseFailed => "ParseFailed",
            RejectionKind::ReadFailed => "ReadFailed",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded per-file rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIssue {
    pub path: PathBuf,
    pub kind: RejectionKind,
    pub detail: String,
    /// SHA-256 of the offending content, only for content rejections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// States of a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Validating,
    Enumerating,
    Scanning,
    Aggregating,
    Done,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Validating => "validating",
            SessionPhase::Enumerating => "enumerating",
            SessionPhase::Scanning => "scanning",
            SessionPhase::Aggregating => "aggregating",
            SessionPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Session-level conditions that end a scan early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    #[error("scan deadline of {limit_ms}ms exceeded")]
    DeadlineExceeded { limit_ms: u64 },
    #[error("memory ceiling exceeded: {sample_bytes} bytes in use, limit {limit_bytes}")]
    MemoryCeilingExceeded { sample_bytes: u64, limit_bytes: u64 },
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
    #[error("scan root rejected: {0}")]
    RootRejected(String),
}

/// Why enumeration stopped before walking the whole tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationStop {
    TotalSizeLimit,
    FileCountLimit,
}

/// Usage of one module across the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleUsage {
    pub module: String,
    /// Number of files importing the module
    pub count: usize,
    /// Share of all counted imports, 0..=100
    pub percentage: f64,
}

/// Security side of the report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySummary {
    /// Files whose content was read and checked
    pub files_processed: usize,
    pub bytes_processed: u64,
    /// Files accepted with advisory suspicious-import flags
    pub flagged_files: usize,
    pub flagged_modules: BTreeMap<String, usize>,
    /// Files whose content was altered by sanitization
    pub sanitized_files: usize,
    /// Rejection details, capped; counts in `ScanReport::rejected` are complete
    pub issues: Vec<FileIssue>,
    #[serde(default)]
    pub issues_truncated: bool,
}

/// Timing statistics for one named operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub last_ms: f64,
}

/// Result cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub size: usize,
    pub capacity: usize,
}

/// Throughput achieved by one scheduling wave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveSummary {
    pub workers: usize,
    pub batch_size: usize,
    pub files: usize,
    pub files_per_second: f64,
}

/// Performance side of the report, derived from the monitor and cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub cache: CacheStats,
    pub memory_bytes: u64,
    pub peak_memory_bytes: u64,
    pub reclaims: usize,
    pub timings: BTreeMap<String, TimingStats>,
    pub waves: Vec<WaveSummary>,
}

/// Scan metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanMetadata {
    pub files_per_second: f64,
    pub timestamp: String,
    pub tool_version: String,
}

impl Default for ScanMetadata {
    fn default() -> Self {
        Self {
            files_per_second: 0.0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Aggregated scan results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    /// Scan root
    pub root: PathBuf,
    /// Files importing each module, excluded modules omitted
    pub module_counts: BTreeMap<String, usize>,
    /// Most used modules, descending
    pub top_modules: Vec<ModuleUsage>,
    /// Candidates that passed enumeration
    pub files_total: usize,
    /// Files whose imports made it into the statistics
    pub files_scanned: usize,
    /// Files included with a partial import set
    pub truncated_files: usize,
    /// Candidates never processed because the session ended first
    pub unprocessed_files: usize,
    /// Sum of `module_counts`
    pub total_imports: usize,
    pub rejected: BTreeMap<RejectionKind, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumeration_stopped: Option<EnumerationStop>,
    pub elapsed_ms: u64,
    pub peak_memory_bytes: u64,
    pub cache_hit_ratio: f64,
    pub security: SecuritySummary,
    pub performance: PerformanceReport,
    pub metadata: ScanMetadata,
}

impl ScanReport {
    /// Count of files rejected for `kind`
    pub fn rejected_count(&self, kind: RejectionKind) -> usize {
        self.rejected.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_rejected(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// Report for a session that ended in the aborted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortedReport {
    pub reason: AbortReason,
    /// Phase the session was in when it aborted
    pub phase: SessionPhase,
    /// Results aggregated up to the abort point
    pub partial: ScanReport,
}

/// Terminal state of a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanOutcome {
    Completed(ScanReport),
    Aborted(AbortedReport),
}

impl ScanOutcome {
    /// The (possibly partial) report
    pub fn report(&self) -> &ScanReport {
        match self {
            ScanOutcome::Completed(report) => report,
            ScanOutcome::Aborted(aborted) => &aborted.partial,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ScanOutcome::Aborted(_))
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            ScanOutcome::Completed(_) => None,
            ScanOutcome::Aborted(aborted) => Some(&aborted.reason),
        }
    }
}

/// Progress snapshot passed to the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    pub files_done: usize,
    pub files_total: usize,
}
