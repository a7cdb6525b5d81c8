//! Security gates applied to every candidate file
//!
//! The checks run cheapest first: path, then size, then raw content, then the
//! parsed import set. None of them mutate shared state except
//! [`SizeBudget`], the session's atomic running total of candidate bytes.

use crate::config::{segments, Policy};
use crate::models::{ImportSet, RejectionKind};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Outcome of a single check; `Err` carries the reason
pub type ValidationVerdict = Result<(), Rejection>;

/// A failed check with its reason
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Traversal spellings that survive path component parsing
const ENCODED_TRAVERSAL: &[&str] = &["..\\", "..%2f", "..%5c", "%2e%2e", ".%2e", "%2e."];

/// Check a path relative to the scan root
pub fn validate_path(path: &Path, policy: &Policy) -> ValidationVerdict {
    let limits = policy.limits();
    let text = path.to_string_lossy();

    if text.len() > limits.max_path_length {
        return Err(Rejection::new(
            RejectionKind::PathRejected,
            format!("path too long: {} bytes", text.len()),
        ));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(Rejection::new(
                    RejectionKind::PathRejected,
                    "path traversal sequence",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Rejection::new(
                    RejectionKind::PathRejected,
                    "absolute path escapes the scan root",
                ));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    let lowered = text.to_ascii_lowercase();
    if let Some(seq) = ENCODED_TRAVERSAL.iter().find(|seq| lowered.contains(*seq)) {
        return Err(Rejection::new(
            RejectionKind::PathRejected,
            format!("encoded traversal sequence `{}`", seq),
        ));
    }

    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    if !policy.allows_extension(&extension) {
        return Err(Rejection::new(
            RejectionKind::PathRejected,
            format!("unsupported extension `{}`", extension),
        ));
    }

    for segment in segments(path) {
        if let Some(pattern) = policy.blocked_pattern(&segment) {
            return Err(Rejection::new(
                RejectionKind::PathRejected,
                format!("blocked path segment `{}` (matches `{}`)", segment, pattern),
            ));
        }
    }

    Ok(())
}

/// Shared running total of accepted candidate bytes
#[derive(Debug)]
pub struct SizeBudget {
    used: AtomicU64,
    limit: u64,
}

impl SizeBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
        }
    }

    /// Reserve `bytes`; fails without reserving if the limit would be passed
    pub fn try_reserve(&self, bytes: u64) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .is_ok()
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Check a file size against the per-file limit and the session budget
pub fn validate_size(size: u64, budget: &SizeBudget, policy: &Policy) -> ValidationVerdict {
    let max = policy.limits().max_file_size;
    if size > max {
        return Err(Rejection::new(
            RejectionKind::SizeRejected,
            format!("file too large: {} bytes (limit {})", size, max),
        ));
    }

    if !budget.try_reserve(size) {
        return Err(Rejection::new(
            RejectionKind::SizeRejected,
            format!(
                "total size limit of {} bytes reached ({} used)",
                budget.limit(),
                budget.used()
            ),
        ));
    }

    Ok(())
}

/// Check raw file content before it is sanitized or parsed
pub fn validate_content(buffer: &[u8], policy: &Policy) -> ValidationVerdict {
    let limits = policy.limits();

    if let Some((index, line)) = buffer
        .split(|b| *b == b'\n')
        .enumerate()
        .find(|(_, line)| line.len() > limits.max_line_length)
    {
        return Err(Rejection::new(
            RejectionKind::ContentRejected,
            format!("line {} too long: {} bytes", index + 1, line.len()),
        ));
    }

    if limits.check_malicious_patterns {
        let patterns = policy.malicious_patterns();
        if let Some(index) = patterns.matches(buffer).iter().next() {
            return Err(Rejection::new(
                RejectionKind::ContentRejected,
                format!("malicious pattern `{}`", patterns.patterns()[index]),
            ));
        }
    }

    let import_count = count_occurrences(buffer, b"import ") + count_occurrences(buffer, b"from ");
    if import_count > limits.max_imports_per_file {
        return Err(Rejection::new(
            RejectionKind::ContentRejected,
            format!("too many imports: {}", import_count),
        ));
    }

    Ok(())
}

/// Flag suspicious modules; rejects only when the policy blocks them
///
/// Returns the flagged modules on success so advisory flags can be counted.
pub fn validate_imports(imports: &ImportSet, policy: &Policy) -> Result<Vec<String>, Rejection> {
    if !policy.limits().validate_imports {
        return Ok(Vec::new());
    }

    let flagged: Vec<String> = imports
        .modules
        .iter()
        .filter(|module| {
            let top = module.split('.').next().unwrap_or(module.as_str());
            policy.is_suspicious(module) || policy.is_suspicious(top)
        })
        .cloned()
        .collect();

    if !flagged.is_empty() && policy.limits().block_suspicious_imports {
        return Err(Rejection::new(
            RejectionKind::ImportFlagged,
            format!("suspicious imports: {}", flagged.join(", ")),
        ));
    }

    Ok(flagged)
}

/// Check the scan root itself; returns its canonical form
pub fn validate_root(root: &Path, policy: &Policy) -> Result<PathBuf, String> {
    let canonical = root
        .canonicalize()
        .map_err(|e| format!("{} cannot be resolved: {}", root.display(), e))?;

    if !canonical.is_dir() {
        return Err(format!("{} is not a directory", canonical.display()));
    }

    fs::read_dir(&canonical)
        .map_err(|e| format!("{} is not readable: {}", canonical.display(), e))?;

    let safe = &policy.limits().safe_directories;
    if !safe.is_empty() {
        let inside = safe
            .iter()
            .filter_map(|dir| dir.canonicalize().ok())
            .any(|dir| canonical.starts_with(dir));
        if !inside {
            return Err(format!(
                "{} is outside the safe directories",
                canonical.display()
            ));
        }
    }

    Ok(canonical)
}

/// Hex SHA-256 of content, used when reporting rejected files
pub fn content_hash(buffer: &[u8]) -> String {
    hex::encode(Sha256::digest(buffer))
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}
