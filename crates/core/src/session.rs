//! Scan session state and aggregation
//!
//! The session exclusively owns the aggregate counters. Workers fill a
//! [`BatchOutcome`] of their own and the orchestrator merges it in once the
//! batch has finished.

use crate::config::Policy;
use crate::models::{
    AbortReason, AbortedReport, CacheStats, EnumerationStop, FileIssue, ImportSet, ModuleUsage,
    RejectionKind, ScanMetadata, ScanOutcome, ScanReport, SecuritySummary, SessionPhase,
};
use crate::monitor::{OperationTimings, ResourceMonitor};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Issues kept with detail in the report; counts are never capped
pub const MAX_REPORTED_ISSUES: usize = 256;

/// Modules listed in `ScanReport::top_modules`
pub const TOP_MODULES: usize = 20;

/// Per-batch accumulator filled by one worker
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Files taken off the batch, whatever their fate
    pub files_done: usize,
    pub files_scanned: usize,
    pub truncated_files: usize,
    /// Files whose content was read and checked
    pub files_read: usize,
    pub bytes_read: u64,
    pub sanitized_files: usize,
    pub flagged_files: usize,
    pub flagged_modules: HashMap<String, usize>,
    pub module_counts: HashMap<String, usize>,
    pub rejected: BTreeMap<RejectionKind, usize>,
    pub issues: Vec<FileIssue>,
    pub timings: OperationTimings,
    /// Set when the worker stopped early because the deadline passed
    pub deadline_hit: bool,
}

impl BatchOutcome {
    /// Count an accepted file's imports
    pub fn accept(&mut self, imports: &ImportSet, flagged: &[String]) {
        self.files_scanned += 1;
        if imports.truncated {
            self.truncated_files += 1;
        }
        for module in &imports.modules {
            *self.module_counts.entry(module.clone()).or_insert(0) += 1;
        }
        if !flagged.is_empty() {
            self.flagged_files += 1;
            for module in flagged {
                *self.flagged_modules.entry(module.clone()).or_insert(0) += 1;
            }
        }
    }

    pub fn reject(&mut self, issue: FileIssue) {
        *self.rejected.entry(issue.kind).or_insert(0) += 1;
        if self.issues.len() < MAX_REPORTED_ISSUES {
            self.issues.push(issue);
        }
    }

    fn issues_dropped(&self) -> bool {
        let rejected: usize = self.rejected.values().sum();
        rejected > self.issues.len()
    }
}

/// One scan invocation
pub struct ScanSession {
    root: PathBuf,
    phase: SessionPhase,
    files_total: usize,
    files_done: usize,
    files_scanned: usize,
    truncated_files: usize,
    module_counts: HashMap<String, usize>,
    rejected: BTreeMap<RejectionKind, usize>,
    security: SecuritySummary,
    enumeration_stopped: Option<EnumerationStop>,
}

impl ScanSession {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            phase: SessionPhase::Idle,
            files_total: 0,
            files_done: 0,
            files_scanned: 0,
            truncated_files: 0,
            module_counts: HashMap::new(),
            rejected: BTreeMap::new(),
            security: SecuritySummary::default(),
            enumeration_stopped: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Advance to the next phase; phases only move forward
    pub fn enter(&mut self, phase: SessionPhase) {
        debug_assert!(
            phase_rank(phase) > phase_rank(self.phase),
            "session cannot move from {} to {}",
            self.phase,
            phase
        );
        info!(from = %self.phase, to = %phase, "Session phase");
        self.phase = phase;
    }

    /// The root may be replaced by its canonical form once validated
    pub fn set_root(&mut self, root: PathBuf) {
        self.root = root;
    }

    /// Record a rejection made outside the workers, during enumeration
    pub fn reject(&mut self, issue: FileIssue) {
        debug!(path = %issue.path.display(), kind = %issue.kind, "{}", issue.detail);
        *self.rejected.entry(issue.kind).or_insert(0) += 1;
        self.push_issue(issue);
    }

    fn push_issue(&mut self, issue: FileIssue) {
        if self.security.issues.len() < MAX_REPORTED_ISSUES {
            self.security.issues.push(issue);
        } else {
            self.security.issues_truncated = true;
        }
    }

    pub fn set_candidates(&mut self, files_total: usize, stopped: Option<EnumerationStop>) {
        self.files_total = files_total;
        self.enumeration_stopped = stopped;
    }

    pub fn files_total(&self) -> usize {
        self.files_total
    }

    pub fn files_done(&self) -> usize {
        self.files_done
    }

    /// Join point: fold one worker's batch into the session
    pub fn merge(&mut self, batch: BatchOutcome, monitor: &mut ResourceMonitor) {
        let dropped = batch.issues_dropped();
        self.files_done += batch.files_done;
        self.files_scanned += batch.files_scanned;
        self.truncated_files += batch.truncated_files;

        for (module, count) in batch.module_counts {
            *self.module_counts.entry(module).or_insert(0) += count;
        }
        for (kind, count) in batch.rejected {
            *self.rejected.entry(kind).or_insert(0) += count;
        }

        for issue in batch.issues {
            self.push_issue(issue);
        }
        if dropped {
            self.security.issues_truncated = true;
        }

        self.security.files_processed += batch.files_read;
        self.security.bytes_processed += batch.bytes_read;
        self.security.sanitized_files += batch.sanitized_files;
        self.security.flagged_files += batch.flagged_files;
        for (module, count) in batch.flagged_modules {
            *self.security.flagged_modules.entry(module).or_insert(0) += count;
        }

        monitor.merge_timings(&batch.timings);
        monitor.record_files(batch.files_done);
    }

    /// Session-wide usage with excluded modules dropped, sorted by name
    fn usage(&self, policy: &Policy) -> BTreeMap<String, usize> {
        self.module_counts
            .iter()
            .filter(|(module, _)| !policy.is_excluded(module))
            .map(|(module, count)| (module.clone(), *count))
            .collect()
    }

    fn build_report(&self, policy: &Policy, monitor: &ResourceMonitor, cache: CacheStats) -> ScanReport {
        let module_counts = self.usage(policy);
        let total_imports: usize = module_counts.values().sum();

        let mut ranked: Vec<(&String, &usize)> = module_counts.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top_modules = ranked
            .into_iter()
            .take(TOP_MODULES)
            .map(|(module, count)| ModuleUsage {
                module: module.clone(),
                count: *count,
                percentage: if total_imports > 0 {
                    *count as f64 * 100.0 / total_imports as f64
                } else {
                    0.0
                },
            })
            .collect();

        let elapsed = monitor.elapsed();
        let performance = monitor.performance_report(cache);

        ScanReport {
            root: self.root.clone(),
            module_counts,
            top_modules,
            files_total: self.files_total,
            files_scanned: self.files_scanned,
            truncated_files: self.truncated_files,
            unprocessed_files: self.files_total.saturating_sub(self.files_done),
            total_imports,
            rejected: self.rejected.clone(),
            enumeration_stopped: self.enumeration_stopped,
            elapsed_ms: elapsed.as_millis() as u64,
            peak_memory_bytes: performance.peak_memory_bytes,
            cache_hit_ratio: performance.cache.hit_ratio,
            security: self.security.clone(),
            performance,
            metadata: ScanMetadata {
                files_per_second: if elapsed.as_secs_f64() > 0.0 {
                    self.files_done as f64 / elapsed.as_secs_f64()
                } else {
                    0.0
                },
                ..ScanMetadata::default()
            },
        }
    }

    /// Aggregate and end in `Done`
    pub fn finish(mut self, policy: &Policy, monitor: &ResourceMonitor, cache: CacheStats) -> ScanOutcome {
        self.enter(SessionPhase::Aggregating);
        let report = self.build_report(policy, monitor, cache);
        self.enter(SessionPhase::Done);
        info!(
            files_scanned = report.files_scanned,
            rejected = report.total_rejected(),
            modules = report.module_counts.len(),
            elapsed_ms = report.elapsed_ms,
            "Scan complete"
        );
        ScanOutcome::Completed(report)
    }

    /// End in `Aborted`, keeping everything aggregated so far
    pub fn abort(self, reason: AbortReason, policy: &Policy, monitor: &ResourceMonitor, cache: CacheStats) -> ScanOutcome {
        warn!(phase = %self.phase, "Scan aborted: {}", reason);
        let partial = self.build_report(policy, monitor, cache);
        ScanOutcome::Aborted(AbortedReport {
            reason,
            phase: self.phase,
            partial,
        })
    }
}

fn phase_rank(phase: SessionPhase) -> u8 {
    match phase {
        SessionPhase::Idle => 0,
        SessionPhase::Validating => 1,
        SessionPhase::Enumerating => 2,
        SessionPhase::Scanning => 3,
        SessionPhase::Aggregating => 4,
        SessionPhase::Done => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsPolicy;
    use std::collections::BTreeSet;

    fn policy() -> Policy {
        LimitsPolicy::default()
            .with_excluded_modules(vec!["os".to_string()])
            .compile()
            .unwrap()
    }

    fn imports(modules: &[&str], truncated: bool) -> ImportSet {
        ImportSet {
            modules: modules.iter().map(|m| m.to_string()).collect::<BTreeSet<_>>(),
            truncated,
            nodes_visited: 10,
        }
    }

    fn issue(kind: RejectionKind) -> FileIssue {
        FileIssue {
            path: PathBuf::from("x.py"),
            kind,
            detail: "rejected".to_string(),
            content_hash: None,
        }
    }

    #[test]
    fn test_merge_is_commutative() {
        let policy = policy();
        let build = |order: &[usize]| {
            let mut monitor = ResourceMonitor::new(&policy);
            let mut session = ScanSession::new(Path::new("/src"));
            session.enter(SessionPhase::Validating);
            session.enter(SessionPhase::Enumerating);
            session.set_candidates(3, None);
            session.enter(SessionPhase::Scanning);

            let mut batches = vec![BatchOutcome::default(), BatchOutcome::default()];
            batches[0].files_done = 2;
            batches[0].accept(&imports(&["numpy", "os"], false), &[]);
            batches[0].reject(issue(RejectionKind::ParseFailed));
            batches[1].files_done = 1;
            batches[1].accept(&imports(&["numpy", "pandas"], true), &["pandas".to_string()]);

            let mut batches: Vec<Option<BatchOutcome>> = batches.into_iter().map(Some).collect();
            for &i in order {
                if let Some(batch) = batches[i].take() {
                    session.merge(batch, &mut monitor);
                }
            }
            session.finish(&policy, &monitor, CacheStats::default())
        };

        let a = build(&[0, 1]);
        let b = build(&[1, 0]);
        assert_eq!(a.report().module_counts, b.report().module_counts);

        let report = a.report();
        assert_eq!(report.module_counts.get("numpy"), Some(&2));
        assert_eq!(report.module_counts.get("pandas"), Some(&1));
        assert!(!report.module_counts.contains_key("os"));
        assert_eq!(report.total_imports, 3);
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.truncated_files, 1);
        assert_eq!(report.rejected_count(RejectionKind::ParseFailed), 1);
        assert_eq!(report.security.flagged_files, 1);
        assert_eq!(report.unprocessed_files, 0);
    }

    #[test]
    fn test_top_modules_percentages() {
        let policy = policy();
        let mut monitor = ResourceMonitor::new(&policy);
        let mut session = ScanSession::new(Path::new("/src"));
        session.enter(SessionPhase::Scanning);

        let mut batch = BatchOutcome::default();
        batch.files_done = 3;
        batch.accept(&imports(&["numpy", "scipy"], false), &[]);
        batch.accept(&imports(&["numpy"], false), &[]);
        batch.accept(&imports(&["numpy"], false), &[]);
        session.merge(batch, &mut monitor);

        let outcome = session.finish(&policy, &monitor, CacheStats::default());
        let top = &outcome.report().top_modules;
        assert_eq!(top[0].module, "numpy");
        assert_eq!(top[0].count, 3);
        assert!((top[0].percentage - 75.0).abs() < 1e-9);
        assert_eq!(top[1].module, "scipy");
    }

    #[test]
    fn test_abort_keeps_partial_results() {
        let policy = policy();
        let mut monitor = ResourceMonitor::new(&policy);
        let mut session = ScanSession::new(Path::new("/src"));
        session.enter(SessionPhase::Enumerating);
        session.set_candidates(10, None);
        session.enter(SessionPhase::Scanning);

        let mut batch = BatchOutcome::default();
        batch.files_done = 4;
        batch.accept(&imports(&["numpy"], false), &[]);
        session.merge(batch, &mut monitor);

        let outcome = session.abort(
            AbortReason::DeadlineExceeded { limit_ms: 5 },
            &policy,
            &monitor,
            CacheStats::default(),
        );
        match outcome {
            ScanOutcome::Aborted(aborted) => {
                assert_eq!(aborted.phase, SessionPhase::Scanning);
                assert_eq!(aborted.partial.unprocessed_files, 6);
                assert_eq!(aborted.partial.module_counts.get("numpy"), Some(&1));
            }
            ScanOutcome::Completed(_) => panic!("expected abort"),
        }
    }

    #[test]
    fn test_issue_details_are_capped() {
        let mut session = ScanSession::new(Path::new("/src"));
        for _ in 0..MAX_REPORTED_ISSUES + 5 {
            session.reject(issue(RejectionKind::PathRejected));
        }
        let policy = policy();
        let monitor = ResourceMonitor::new(&policy);
        let outcome = session.abort(
            AbortReason::ConfigurationInvalid("test".into()),
            &policy,
            &monitor,
            CacheStats::default(),
        );
        let report = outcome.report();
        assert_eq!(report.rejected_count(RejectionKind::PathRejected), MAX_REPORTED_ISSUES + 5);
        assert_eq!(report.security.issues.len(), MAX_REPORTED_ISSUES);
        assert!(report.security.issues_truncated);
    }
}
