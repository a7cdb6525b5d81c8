use crate::cache::{CacheError, CacheKey, ImportCache, ResultCache};
use crate::config::{IgnoreFilter, LimitsPolicy, Policy, PolicyError};
use crate::models::{
    AbortReason, AbortedReport, CacheStats, EnumerationStop, FileIssue, FileRecord, ImportSet,
    RejectionKind, ScanOutcome, ScanProgress, ScanReport, SessionPhase,
};
use crate::monitor::{available_memory_bytes, Deadline, MemoryWatch, ResourceMonitor};
use crate::parsers::{create_parser, ImportParser, ParseLimits, ParserError};
use crate::sanitizer::sanitize;
use crate::scheduler::{plan, WorkerPools};
use crate::session::{BatchOutcome, ScanSession};
use crate::validator::{
    content_hash, validate_content, validate_imports, validate_path, validate_root, validate_size,
    Rejection, SizeBudget,
};
use std::any::Any;
use std::fs::File;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::{Instant, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

type BoxedParser = Box<dyn ImportParser + Send>;

/// Orchestrates validated, cached, parallel import scans
///
/// The cache and worker pools outlive a single scan, so repeated scans of
/// the same tree reuse earlier parse results.
pub struct ImportScanner {
    policy: Policy,
    cache: ImportCache,
    pools: WorkerPools,
}

impl ImportScanner {
    pub fn new(limits: LimitsPolicy) -> Result<Self, PolicyError> {
        Ok(Self::with_policy(limits.compile()?))
    }

    pub fn with_policy(policy: Policy) -> Self {
        let cache = ResultCache::new(policy.limits().cache_size, policy.cache_ttl());
        Self {
            policy,
            cache,
            pools: WorkerPools::new(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn cache(&self) -> &ImportCache {
        &self.cache
    }

    /// Restore parse results saved by a scanner with the same analysis options
    pub fn load_cache_snapshot(&self, path: &Path) -> Result<usize, CacheError> {
        self.cache.load_snapshot(path, &self.policy.fingerprint())
    }

    pub fn save_cache_snapshot(&self, path: &Path) -> Result<usize, CacheError> {
        self.cache.save_snapshot(path, &self.policy.fingerprint())
    }

    /// Scan `root` and return the terminal state of the session
    pub fn scan(&self, root: &Path) -> ScanOutcome {
        self.scan_with_progress(root, &|_| {})
    }

    /// Scan `root`, reporting progress once per wave of batches
    #[instrument(skip(self, root, progress), fields(root = %root.display()))]
    pub fn scan_with_progress(&self, root: &Path, progress: &dyn Fn(ScanProgress)) -> ScanOutcome {
        let cache_before = self.cache.stats();
        let mut monitor = ResourceMonitor::new(&self.policy);
        let mut session = ScanSession::new(root);

        session.enter(SessionPhase::Validating);
        let root = match validate_root(root, &self.policy) {
            Ok(root) => root,
            Err(detail) => {
                let stats = self.session_cache_stats(&cache_before);
                return session.abort(AbortReason::RootRejected(detail), &self.policy, &monitor, stats);
            }
        };
        session.set_root(root.clone());
        info!("Starting scan of {}", root.display());

        // The walk checks the deadline before its first entry
        session.enter(SessionPhase::Enumerating);
        monitor.start_timer("enumerate");
        let enumerated = self.enumerate(&root, &mut session, monitor.deadline());
        monitor.end_timer("enumerate");
        let candidates = match enumerated {
            Ok(candidates) => candidates,
            Err(reason) => {
                let stats = self.session_cache_stats(&cache_before);
                return session.abort(reason, &self.policy, &monitor, stats);
            }
        };
        info!(candidates = candidates.len(), "Enumeration finished");

        session.enter(SessionPhase::Scanning);
        if let Err(reason) = self.run_waves(&candidates, &mut session, &mut monitor, progress) {
            let stats = self.session_cache_stats(&cache_before);
            return session.abort(reason, &self.policy, &monitor, stats);
        }

        let stats = self.session_cache_stats(&cache_before);
        session.finish(&self.policy, &monitor, stats)
    }

    /// Cache counters for this session only
    fn session_cache_stats(&self, before: &CacheStats) -> CacheStats {
        let now = self.cache.stats();
        let hits = now.hits - before.hits;
        let misses = now.misses - before.misses;
        CacheStats {
            hits,
            misses,
            hit_ratio: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            size: now.size,
            capacity: now.capacity,
        }
    }

    /// Walk the tree and collect validated candidates
    fn enumerate(
        &self,
        root: &Path,
        session: &mut ScanSession,
        deadline: Deadline,
    ) -> Result<Vec<FileRecord>, AbortReason> {
        let limits = self.policy.limits();
        let filter = IgnoreFilter::new(root, &self.policy);
        let budget = SizeBudget::new(limits.max_total_bytes);
        let mut files = Vec::new();
        let mut stopped = None;

        let mut walker = WalkDir::new(root).follow_links(false).into_iter();

        while let Some(entry) = walker.next() {
            if deadline.expired() {
                return Err(AbortReason::DeadlineExceeded {
                    limit_ms: deadline.limit().as_millis() as u64,
                });
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root);
                    let relative = path.strip_prefix(root).unwrap_or(path);
                    session.reject(issue(relative, RejectionKind::ReadFailed, err.to_string(), None));
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                if filter.should_ignore(path, true) {
                    walker.skip_current_dir();
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if self.policy.is_blocked_segment(&name) {
                    session.reject(issue(
                        relative,
                        RejectionKind::PathRejected,
                        format!("blocked directory `{}`", name),
                        None,
                    ));
                    walker.skip_current_dir();
                    continue;
                }
                if entry.depth() >= limits.max_depth {
                    session.reject(issue(
                        relative,
                        RejectionKind::PathRejected,
                        format!("maximum depth {} exceeded", limits.max_depth),
                        None,
                    ));
                    walker.skip_current_dir();
                }
                continue;
            }

            if filter.should_ignore(path, false) {
                continue;
            }

            if file_type.is_symlink() {
                session.reject(issue(
                    relative,
                    RejectionKind::PathRejected,
                    "symbolic links are not followed",
                    None,
                ));
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            if let Err(rejection) = validate_path(relative, &self.policy) {
                session.reject(from_rejection(relative, rejection, None));
                continue;
            }

            if files.len() >= limits.max_files {
                stopped = Some(EnumerationStop::FileCountLimit);
                break;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    session.reject(issue(relative, RejectionKind::ReadFailed, err.to_string(), None));
                    continue;
                }
            };

            let size = metadata.len();
            if let Err(rejection) = validate_size(size, &budget, &self.policy) {
                session.reject(from_rejection(relative, rejection, None));
                if size <= limits.max_file_size {
                    stopped = Some(EnumerationStop::TotalSizeLimit);
                    break;
                }
                continue;
            }

            files.push(FileRecord {
                path: path.to_path_buf(),
                relative_path: relative.to_path_buf(),
                size,
                modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            });
        }

        if let Some(stop) = stopped {
            warn!(?stop, candidates = files.len(), "Enumeration stopped early");
        }
        session.set_candidates(files.len(), stopped);
        Ok(files)
    }

    /// Dispatch candidates in waves, re-planning between waves
    fn run_waves(
        &self,
        candidates: &[FileRecord],
        session: &mut ScanSession,
        monitor: &mut ResourceMonitor,
        progress: &dyn Fn(ScanProgress),
    ) -> Result<(), AbortReason> {
        let mut remaining = candidates;

        while !remaining.is_empty() {
            monitor.check_deadline()?;

            let plan = plan(
                remaining.len(),
                available_memory_bytes(),
                monitor.history(),
                &self.policy,
            );
            let (wave, rest) = remaining.split_at(plan.wave_size().min(remaining.len()));
            let deadline = monitor.deadline();
            let watch = monitor.memory_watch();
            let done_before = session.files_done();
            let started = Instant::now();

            let batches = self
                .pools
                .dispatch(plan, wave, |batch| self.scan_batch(batch, deadline, &watch));

            let mut deadline_hit = false;
            for batch in batches {
                deadline_hit |= batch.deadline_hit;
                session.merge(batch, monitor);
            }
            monitor.record_wave(
                plan.workers,
                plan.batch_size,
                session.files_done() - done_before,
                started.elapsed(),
            );
            progress(ScanProgress {
                files_done: session.files_done(),
                files_total: session.files_total(),
            });

            if deadline_hit {
                monitor.check_deadline()?;
            }
            monitor.absorb_memory(watch)?;
            if monitor.should_reclaim_memory() {
                monitor.reclaim(&self.cache);
            }

            remaining = rest;
        }

        Ok(())
    }

    /// Worker body: one batch of files with a local accumulator
    ///
    /// The deadline and the memory ceiling are checked between files.
    fn scan_batch(&self, batch: &[FileRecord], deadline: Deadline, watch: &MemoryWatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut parser: Option<BoxedParser> = None;

        for record in batch {
            if deadline.expired() {
                outcome.deadline_hit = true;
                break;
            }
            if watch.exceeded() {
                break;
            }
            outcome.files_done += 1;

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.scan_file(record, &mut parser, &mut outcome)
            }));

            match result {
                Ok(Ok(())) => {}
                Ok(Err(issue)) => outcome.reject(issue),
                Err(payload) => {
                    // The parser may be mid-parse; start the next file fresh
                    parser = None;
                    let detail = format!("parser panicked: {}", panic_message(payload.as_ref()));
                    warn!(path = %record.relative_path.display(), "{}", detail);
                    outcome.reject(issue(&record.relative_path, RejectionKind::ParseFailed, detail, None));
                }
            }
            watch.file_done(&self.cache);
        }

        outcome
    }

    /// Cache lookup, then read, validate, sanitize and parse on a miss
    fn scan_file(
        &self,
        record: &FileRecord,
        parser: &mut Option<BoxedParser>,
        outcome: &mut BatchOutcome,
    ) -> Result<(), FileIssue> {
        let key = CacheKey::new(&record.path, record.size, record.modified);

        let imports = match self.cache.get(&key) {
            Some(imports) => {
                debug!(path = %record.relative_path.display(), "Cache hit");
                imports
            }
            None => {
                let imports = self.analyze(record, parser, outcome)?;
                // Only content-checked results are cached; imports are re-validated on every hit
                self.cache.put(key, imports.clone());
                imports
            }
        };

        let flagged = validate_imports(&imports, &self.policy)
            .map_err(|rejection| from_rejection(&record.relative_path, rejection, None))?;
        if !flagged.is_empty() {
            warn!(
                path = %record.relative_path.display(),
                modules = %flagged.join(", "),
                "Suspicious imports"
            );
        }

        outcome.accept(&imports, &flagged);
        Ok(())
    }

    fn analyze(
        &self,
        record: &FileRecord,
        parser: &mut Option<BoxedParser>,
        outcome: &mut BatchOutcome,
    ) -> Result<ImportSet, FileIssue> {
        let limits = self.policy.limits();
        let relative = record.relative_path.as_path();

        let buffer = outcome
            .timings
            .time("read", || read_bounded(&record.path, limits.max_file_size))
            .map_err(|e| issue(relative, RejectionKind::ReadFailed, e.to_string(), None))?;
        if buffer.len() as u64 > limits.max_file_size {
            return Err(issue(
                relative,
                RejectionKind::SizeRejected,
                "file grew past the size limit after enumeration",
                None,
            ));
        }
        outcome.files_read += 1;
        outcome.bytes_read += buffer.len() as u64;

        if let Err(rejection) = outcome
            .timings
            .time("validate", || validate_content(&buffer, &self.policy))
        {
            warn!(path = %relative.display(), "Content rejected: {}", rejection.detail);
            return Err(from_rejection(relative, rejection, Some(content_hash(&buffer))));
        }

        let text = if limits.sanitize_content {
            let (text, changed) = outcome.timings.time("sanitize", || sanitize(&buffer));
            if changed {
                outcome.sanitized_files += 1;
            }
            text
        } else {
            String::from_utf8_lossy(&buffer).into_owned()
        };

        let parser = parser_slot(parser, ParseLimits::from_policy(&self.policy))
            .map_err(|e| issue(relative, RejectionKind::ParseFailed, e.to_string(), None))?;
        let imports = outcome
            .timings
            .time("parse", || parser.parse_imports(&text))
            .map_err(|e| issue(relative, RejectionKind::ParseFailed, e.to_string(), None))?;

        if imports.truncated {
            debug!(
                path = %relative.display(),
                nodes = imports.nodes_visited,
                "Import walk truncated"
            );
        }
        Ok(imports)
    }
}

/// Scan `root` under `limits`
///
/// An invalid policy ends the session in `Aborted(ConfigurationInvalid)`
/// before any file is touched.
pub fn scan(root: &Path, limits: LimitsPolicy) -> ScanOutcome {
    match ImportScanner::new(limits) {
        Ok(scanner) => scanner.scan(root),
        Err(err) => {
            warn!("Invalid scan policy: {}", err);
            ScanOutcome::Aborted(AbortedReport {
                reason: AbortReason::ConfigurationInvalid(err.to_string()),
                phase: SessionPhase::Validating,
                partial: ScanReport {
                    root: root.to_path_buf(),
                    ..ScanReport::default()
                },
            })
        }
    }
}

/// Created lazily so a batch of cache hits never builds a parser
fn parser_slot(slot: &mut Option<BoxedParser>, limits: ParseLimits) -> Result<&mut BoxedParser, ParserError> {
    if slot.is_none() {
        *slot = Some(create_parser(limits)?);
    }
    slot.as_mut()
        .ok_or_else(|| ParserError::InitError("parser unavailable".to_string()))
}

/// Read at most `max + 1` bytes so an oversized file is detected without
/// loading all of it
fn read_bounded(path: &Path, max: u64) -> std::io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buffer = Vec::new();
    file.take(max.saturating_add(1)).read_to_end(&mut buffer)?;
    Ok(buffer)
}

fn issue(path: &Path, kind: RejectionKind, detail: impl Into<String>, hash: Option<String>) -> FileIssue {
    FileIssue {
        path: path.to_path_buf(),
        kind,
        detail: detail.into(),
        content_hash: hash,
    }
}

fn from_rejection(path: &Path, rejection: Rejection, hash: Option<String>) -> FileIssue {
    issue(path, rejection.kind, rejection.detail, hash)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
