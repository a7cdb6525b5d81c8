//! Limits policy for a scan session
//!
//! [`LimitsPolicy`] is the flat, serializable option set handed in by the
//! caller. [`LimitsPolicy::compile`] validates it once, before any file is
//! touched, and freezes it into a [`Policy`] with compiled pattern sets that
//! every component shares read-only for the rest of the session.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use regex::bytes::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Schema version understood by this build
pub const POLICY_VERSION: u32 = 1;

const GLOB_META: &[char] = &['*', '?', '[', '{'];

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Unsupported policy version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("Limit `{0}` must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("Invalid option `{field}`: {message}")]
    InvalidOption { field: &'static str, message: String },
    #[error("Invalid malicious pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Invalid blocked pattern: {0}")]
    Glob(#[from] globset::Error),
    #[error("Failed to parse policy: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Security and performance thresholds for one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsPolicy {
    /// Policy schema version
    pub version: u32,

    /// Largest file considered, in bytes
    pub max_file_size: u64,
    /// Most candidate files per scan
    pub max_files: usize,
    /// Budget for the sum of candidate sizes, in bytes
    pub max_total_bytes: u64,
    /// Longest relative path accepted, in bytes
    pub max_path_length: usize,
    /// Deepest directory level walked below the root
    pub max_depth: usize,
    /// Longest line accepted in file content
    pub max_line_length: usize,
    /// Most `import `/`from ` occurrences accepted in one file
    pub max_imports_per_file: usize,

    /// Accepted file extensions, with leading dot
    pub allowed_extensions: Vec<String>,
    /// Substrings rejected anywhere in a path segment; entries with glob
    /// metacharacters match whole segments as globs instead
    pub blocked_patterns: Vec<String>,
    /// If non-empty, the scan root must lie inside one of these
    pub safe_directories: Vec<PathBuf>,
    /// Regexes that reject content before parsing
    pub malicious_patterns: Vec<String>,
    /// Modules flagged when imported
    pub suspicious_modules: Vec<String>,
    /// Modules left out of usage statistics
    pub excluded_modules: Vec<String>,

    pub check_malicious_patterns: bool,
    pub validate_imports: bool,
    /// Reject files importing a suspicious module instead of only flagging them
    pub block_suspicious_imports: bool,
    pub sanitize_content: bool,
    /// Collapse `a.b.c` to `a`
    pub top_level_only: bool,
    pub respect_gitignore: bool,

    /// Syntax nodes visited before the parse is truncated
    pub max_parse_nodes: usize,
    pub parse_timeout_ms: u64,

    /// Wall-clock budget for the session; 0 expires immediately
    pub max_scan_duration_ms: u64,
    /// Resident memory ceiling, in bytes
    pub max_memory_bytes: u64,
    pub max_workers: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,

    pub cache_size: usize,
    pub cache_ttl_secs: u64,
    /// Files processed between memory reclaims
    pub gc_threshold: usize,
    /// Files processed between memory samples
    pub memory_check_interval: usize,
    /// Throughput samples kept for scheduling
    pub history_window: usize,
    /// Consecutive over-ceiling samples tolerated after reclaiming
    pub max_reclaim_attempts: usize,
}

impl Default for LimitsPolicy {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION,
            max_file_size: 50 * 1024 * 1024,
            max_files: 10_000,
            max_total_bytes: 1024 * 1024 * 1024,
            max_path_length: 4096,
            max_depth: 64,
            max_line_length: 10_000,
            max_imports_per_file: 1000,
            allowed_extensions: to_strings(&[".py", ".pyw", ".pyx", ".pxd"]),
            blocked_patterns: to_strings(&[
                "__pycache__",
                ".git",
                ".svn",
                ".hg",
                ".bzr",
                "node_modules",
                "venv",
                ".venv",
                "env",
                ".env",
                "build",
                "dist",
                ".pytest_cache",
                ".coverage",
                ".tox",
                ".mypy_cache",
                ".cache",
                "tmp",
                "temp",
            ]),
            safe_directories: Vec::new(),
            malicious_patterns: to_strings(&[
                r"(?i)eval\s*\(",
                r"(?i)exec\s*\(",
                r"(?i)__import__\s*\(",
                r"(?i)compile\s*\(",
                r"(?i)input\s*\(",
                r"(?i)raw_input\s*\(",
                r"(?i)os\.system\s*\(",
                r"(?i)subprocess\..*\(",
                r#"(?i)open\s*\(.*['"]w['"]"#,
                r#"(?i)file\s*\(.*['"]w['"]"#,
            ]),
            suspicious_modules: to_strings(&[
                "pickle",
                "marshal",
                "shelve",
                "dill",
                "cloudpickle",
                "subprocess",
                "os",
                "sys",
                "ctypes",
                "mmap",
                "socket",
                "urllib",
                "requests",
                "ftplib",
                "smtplib",
                "telnetlib",
                "poplib",
                "imaplib",
                "nntplib",
            ]),
            excluded_modules: default_excluded_modules(),
            check_malicious_patterns: true,
            validate_imports: true,
            block_suspicious_imports: false,
            sanitize_content: true,
            top_level_only: true,
            respect_gitignore: false,
            max_parse_nodes: 100_000,
            parse_timeout_ms: 2_000,
            max_scan_duration_ms: 3_600_000,
            max_memory_bytes: 1024 * 1024 * 1024,
            max_workers: 8,
            min_batch_size: 10,
            max_batch_size: 200,
            cache_size: 1000,
            cache_ttl_secs: 3600,
            gc_threshold: 100,
            memory_check_interval: 50,
            history_window: 10,
            max_reclaim_attempts: 3,
        }
    }
}

impl LimitsPolicy {
    /// Parse a policy from TOML; omitted keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(source)?)
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_max_files(mut self, files: usize) -> Self {
        self.max_files = files;
        self
    }

    pub fn with_max_total_bytes(mut self, bytes: u64) -> Self {
        self.max_total_bytes = bytes;
        self
    }

    pub fn with_allowed_extensions(mut self, extensions: Vec<String>) -> Self {
        self.allowed_extensions = extensions;
        self
    }

    pub fn with_blocked_patterns(mut self, patterns: Vec<String>) -> Self {
        self.blocked_patterns = patterns;
        self
    }

    pub fn with_safe_directories(mut self, dirs: Vec<PathBuf>) -> Self {
        self.safe_directories = dirs;
        self
    }

    pub fn with_malicious_patterns(mut self, patterns: Vec<String>) -> Self {
        self.malicious_patterns = patterns;
        self
    }

    pub fn with_suspicious_modules(mut self, modules: Vec<String>) -> Self {
        self.suspicious_modules = modules;
        self
    }

    pub fn with_excluded_modules(mut self, modules: Vec<String>) -> Self {
        self.excluded_modules = modules;
        self
    }

    pub fn with_block_suspicious_imports(mut self, block: bool) -> Self {
        self.block_suspicious_imports = block;
        self
    }

    pub fn with_respect_gitignore(mut self, respect: bool) -> Self {
        self.respect_gitignore = respect;
        self
    }

    pub fn with_max_parse_nodes(mut self, nodes: usize) -> Self {
        self.max_parse_nodes = nodes;
        self
    }

    pub fn with_max_scan_duration(mut self, duration: Duration) -> Self {
        self.max_scan_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_batch_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_batch_size = min;
        self.max_batch_size = max;
        self
    }

    pub fn with_cache(mut self, size: usize, ttl: Duration) -> Self {
        self.cache_size = size;
        self.cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Validate every option and freeze the policy for a session
    pub fn compile(self) -> Result<Policy, PolicyError> {
        if self.version != POLICY_VERSION {
            return Err(PolicyError::Version {
                found: self.version,
                expected: POLICY_VERSION,
            });
        }

        let limits: [(&'static str, u64); 20] = [
            ("max_file_size", self.max_file_size),
            ("max_files", self.max_files as u64),
            ("max_total_bytes", self.max_total_bytes),
            ("max_path_length", self.max_path_length as u64),
            ("max_depth", self.max_depth as u64),
            ("max_line_length", self.max_line_length as u64),
            ("max_imports_per_file", self.max_imports_per_file as u64),
            ("max_parse_nodes", self.max_parse_nodes as u64),
            ("parse_timeout_ms", self.parse_timeout_ms),
            ("max_memory_bytes", self.max_memory_bytes),
            ("max_workers", self.max_workers as u64),
            ("min_batch_size", self.min_batch_size as u64),
            ("max_batch_size", self.max_batch_size as u64),
            ("cache_size", self.cache_size as u64),
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("gc_threshold", self.gc_threshold as u64),
            ("memory_check_interval", self.memory_check_interval as u64),
            ("history_window", self.history_window as u64),
            ("max_reclaim_attempts", self.max_reclaim_attempts as u64),
            ("allowed_extensions", self.allowed_extensions.len() as u64),
        ];
        if let Some(&(name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(PolicyError::ZeroLimit(name));
        }

        if self.min_batch_size > self.max_batch_size {
            return Err(PolicyError::InvalidOption {
                field: "min_batch_size",
                message: format!(
                    "{} exceeds max_batch_size {}",
                    self.min_batch_size, self.max_batch_size
                ),
            });
        }

        let mut extensions = HashSet::new();
        for ext in &self.allowed_extensions {
            let valid = ext.len() > 1
                && ext.starts_with('.')
                && ext[1..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(PolicyError::InvalidOption {
                    field: "allowed_extensions",
                    message: format!("`{}` is not of the form `.ext`", ext),
                });
            }
            extensions.insert(ext.to_ascii_lowercase());
        }

        let suspicious_modules = module_set("suspicious_modules", &self.suspicious_modules)?;
        let excluded_modules = module_set("excluded_modules", &self.excluded_modules)?;

        let malicious = RegexSetBuilder::new(&self.malicious_patterns)
            .size_limit(16 * 1024 * 1024)
            .build()?;

        let mut blocked_substrings = Vec::new();
        let mut blocked_globs = GlobSetBuilder::new();
        for pattern in &self.blocked_patterns {
            if pattern.is_empty() || pattern.contains('/') || pattern.contains('\\') {
                return Err(PolicyError::InvalidOption {
                    field: "blocked_patterns",
                    message: format!("`{}` must name a single path segment", pattern),
                });
            }
            if pattern.contains(GLOB_META) {
                blocked_globs.add(Glob::new(pattern)?);
            } else {
                blocked_substrings.push(pattern.clone());
            }
        }
        let blocked_globs = blocked_globs.build()?;

        Ok(Policy {
            extensions,
            suspicious_modules,
            excluded_modules,
            malicious,
            blocked_substrings,
            blocked_globs,
            limits: self,
        })
    }
}

/// A validated, immutable policy shared by all components of a session
#[derive(Debug, Clone)]
pub struct Policy {
    limits: LimitsPolicy,
    extensions: HashSet<String>,
    suspicious_modules: HashSet<String>,
    excluded_modules: HashSet<String>,
    malicious: RegexSet,
    blocked_substrings: Vec<String>,
    blocked_globs: GlobSet,
}

impl Policy {
    /// The options this policy was compiled from
    pub fn limits(&self) -> &LimitsPolicy {
        &self.limits
    }

    pub fn allows_extension(&self, ext: &str) -> bool {
        self.extensions.contains(&ext.to_ascii_lowercase())
    }

    /// The blocked pattern matching a single path segment, if any
    ///
    /// Plain patterns match as substrings, so `env` also blocks `environment`.
    pub fn blocked_pattern(&self, segment: &str) -> Option<&str> {
        if let Some(pattern) = self
            .blocked_substrings
            .iter()
            .find(|pattern| segment.contains(pattern.as_str()))
        {
            return Some(pattern.as_str());
        }
        self.blocked_globs
            .matches(segment)
            .first()
            .and_then(|&index| self.glob_patterns().nth(index))
    }

    pub fn is_blocked_segment(&self, segment: &str) -> bool {
        self.blocked_pattern(segment).is_some()
    }

    fn glob_patterns(&self) -> impl Iterator<Item = &str> {
        self.limits
            .blocked_patterns
            .iter()
            .map(String::as_str)
            .filter(|pattern| pattern.contains(GLOB_META))
    }

    pub fn malicious_patterns(&self) -> &RegexSet {
        &self.malicious
    }

    pub fn is_suspicious(&self, module: &str) -> bool {
        self.suspicious_modules.contains(module)
    }

    pub fn is_excluded(&self, module: &str) -> bool {
        self.excluded_modules.contains(module)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.limits.max_scan_duration_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.limits.cache_ttl_secs)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.parse_timeout_ms)
    }

    /// SHA-256 over the options that decide what a cached parse result holds
    ///
    /// Two policies with the same fingerprint read, check and parse a file
    /// identically, so their cached results are interchangeable.
    pub fn fingerprint(&self) -> String {
        #[derive(Serialize)]
        struct AnalysisOptions<'a> {
            version: u32,
            max_file_size: u64,
            max_line_length: usize,
            max_imports_per_file: usize,
            check_malicious_patterns: bool,
            malicious_patterns: &'a [String],
            sanitize_content: bool,
            top_level_only: bool,
            max_parse_nodes: usize,
            parse_timeout_ms: u64,
        }

        let limits = &self.limits;
        let options = AnalysisOptions {
            version: limits.version,
            max_file_size: limits.max_file_size,
            max_line_length: limits.max_line_length,
            max_imports_per_file: limits.max_imports_per_file,
            check_malicious_patterns: limits.check_malicious_patterns,
            malicious_patterns: &limits.malicious_patterns,
            sanitize_content: limits.sanitize_content,
            top_level_only: limits.top_level_only,
            max_parse_nodes: limits.max_parse_nodes,
            parse_timeout_ms: limits.parse_timeout_ms,
        };
        // Serializing plain fields and strings cannot fail
        let encoded = serde_json::to_vec(&options).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }
}

/// Non-security filter applied during enumeration
pub struct IgnoreFilter {
    gitignore: Option<Gitignore>,
}

impl IgnoreFilter {
    pub fn new(root: &Path, policy: &Policy) -> Self {
        let gitignore = if policy.limits().respect_gitignore {
            let gitignore_path = root.join(".gitignore");
            if gitignore_path.exists() {
                let mut builder = GitignoreBuilder::new(root);
                if let Some(err) = builder.add(&gitignore_path) {
                    tracing::warn!(error = %err, "Partially parsed .gitignore");
                }
                match builder.build() {
                    Ok(gi) => Some(gi),
                    Err(err) => {
                        tracing::warn!(error = %err, "Ignoring unreadable .gitignore");
                        None
                    }
                }
            } else {
                None
            }
        } else {
            None
        };

        Self { gitignore }
    }

    /// Check if a path should be left out of the candidate set
    pub fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
        match self.gitignore {
            Some(ref gi) => gi.matched(path, is_dir).is_ignore(),
            None => false,
        }
    }
}

fn module_set(field: &'static str, modules: &[String]) -> Result<HashSet<String>, PolicyError> {
    let mut set = HashSet::with_capacity(modules.len());
    for module in modules {
        if !is_dotted_identifier(module) {
            return Err(PolicyError::InvalidOption {
                field,
                message: format!("`{}` is not a dotted module name", module),
            });
        }
        set.insert(module.clone());
    }
    Ok(set)
}

/// `a`, `a.b`, `_a.b1`; no empty segments, no leading digits
pub fn is_dotted_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) if first.is_alphabetic() || first == '_' => {
                    chars.all(|c| c.is_alphanumeric() || c == '_')
                }
                _ => false,
            }
        })
}

/// Normal components of a path as strings, lossy
pub(crate) fn segments(path: &Path) -> impl Iterator<Item = std::borrow::Cow<'_, str>> {
    path.components().filter_map(|c| match c {
        Component::Normal(s) => Some(s.to_string_lossy()),
        _ => None,
    })
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_excluded_modules() -> Vec<String> {
    to_strings(&[
        "__future__", "warnings", "io", "typing", "collections", "contextlib", "types", "abc",
        "ssl", "distutils", "operator", "pathlib", "dataclasses", "inspect", "socket", "shutil",
        "tempfile", "zipfile", "struct", "base64", "optparse", "textwrap", "setuptools",
        "pkg_resources", "enum", "copy", "importlib", "traceback", "binascii", "stat", "errno",
        "posixpath", "zlib", "bisect", "weakref", "winreg", "fnmatch", "site", "email", "html",
        "mimetypes", "locale", "calendar", "shlex", "unicodedata", "pkgutil", "ipaddress", "os",
        "sys", "re", "json", "datetime", "time", "math", "random", "itertools", "functools",
        "logging", "subprocess", "threading", "multiprocessing",
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_compiles() {
        let policy = LimitsPolicy::default().compile().unwrap();
        assert!(policy.allows_extension(".py"));
        assert!(policy.allows_extension(".PY"));
        assert!(!policy.allows_extension(".txt"));
        assert!(policy.is_blocked_segment("__pycache__"));
        assert_eq!(policy.blocked_pattern("environment"), Some("env"));
        assert!(!policy.is_blocked_segment("src"));
        assert!(policy.is_suspicious("pickle"));
        assert!(policy.is_excluded("os"));
        assert!(!policy.is_excluded("numpy"));
    }

    #[test]
    fn test_policy_builder() {
        let policy = LimitsPolicy::default()
            .with_max_file_size(1000)
            .with_allowed_extensions(vec![".scr".to_string()])
            .with_max_workers(2);

        assert_eq!(policy.max_file_size, 1000);
        assert_eq!(policy.max_workers, 2);
        let compiled = policy.compile().unwrap();
        assert!(compiled.allows_extension(".scr"));
        assert!(!compiled.allows_extension(".py"));
    }

    #[test]
    fn test_zero_limit_is_invalid() {
        let err = LimitsPolicy::default().with_max_files(0).compile().unwrap_err();
        assert!(matches!(err, PolicyError::ZeroLimit("max_files")));
    }

    #[test]
    fn test_zero_scan_duration_is_allowed() {
        let policy = LimitsPolicy::default()
            .with_max_scan_duration(Duration::ZERO)
            .compile()
            .unwrap();
        assert_eq!(policy.scan_duration(), Duration::ZERO);
    }

    #[test]
    fn test_empty_extension_set_is_invalid() {
        let err = LimitsPolicy::default()
            .with_allowed_extensions(vec![])
            .compile()
            .unwrap_err();
        assert!(matches!(err, PolicyError::ZeroLimit("allowed_extensions")));
    }

    #[test]
    fn test_malformed_entries_are_invalid() {
        let bad_regex = LimitsPolicy::default()
            .with_malicious_patterns(vec!["eval(".to_string()])
            .compile();
        assert!(matches!(bad_regex, Err(PolicyError::Pattern(_))));

        let bad_module = LimitsPolicy::default()
            .with_suspicious_modules(vec!["not a module".to_string()])
            .compile();
        assert!(matches!(bad_module, Err(PolicyError::InvalidOption { .. })));

        let bad_ext = LimitsPolicy::default()
            .with_allowed_extensions(vec!["py".to_string()])
            .compile();
        assert!(matches!(bad_ext, Err(PolicyError::InvalidOption { .. })));

        let bad_glob = LimitsPolicy::default()
            .with_blocked_patterns(vec!["a/b".to_string()])
            .compile();
        assert!(matches!(bad_glob, Err(PolicyError::InvalidOption { .. })));
    }

    #[test]
    fn test_version_mismatch() {
        let policy = LimitsPolicy {
            version: 2,
            ..Default::default()
        };
        assert!(matches!(policy.compile(), Err(PolicyError::Version { found: 2, .. })));
    }

    #[test]
    fn test_from_toml() {
        let policy = LimitsPolicy::from_toml_str(
            r#"
            max_file_size = 2048
            allowed_extensions = [".py"]
            block_suspicious_imports = true
            "#,
        )
        .unwrap();
        assert_eq!(policy.max_file_size, 2048);
        assert!(policy.block_suspicious_imports);
        assert_eq!(policy.max_files, LimitsPolicy::default().max_files);
    }

    #[test]
    fn test_unknown_toml_key_is_rejected() {
        let result = LimitsPolicy::from_toml_str("max_fle_size = 10");
        assert!(matches!(result, Err(PolicyError::Toml(_))));
    }

    #[test]
    fn test_fingerprint_tracks_analysis_options() {
        let base = LimitsPolicy::default().compile().unwrap().fingerprint();
        assert_eq!(base.len(), 64);

        let scheduling = LimitsPolicy::default()
            .with_max_workers(2)
            .with_cache(10, Duration::from_secs(5))
            .compile()
            .unwrap();
        assert_eq!(scheduling.fingerprint(), base);

        let lenient = LimitsPolicy {
            check_malicious_patterns: false,
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert_ne!(lenient.fingerprint(), base);

        let full_names = LimitsPolicy {
            top_level_only: false,
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert_ne!(full_names.fingerprint(), base);
    }

    #[test]
    fn test_dotted_identifier() {
        assert!(is_dotted_identifier("os"));
        assert!(is_dotted_identifier("os.path"));
        assert!(is_dotted_identifier("_private"));
        assert!(!is_dotted_identifier(""));
        assert!(!is_dotted_identifier("os."));
        assert!(!is_dotted_identifier("1abc"));
        assert!(!is_dotted_identifier("a-b"));
    }

    #[test]
    fn test_gitignore_filter() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "generated/\n").unwrap();

        let policy = LimitsPolicy::default()
            .with_respect_gitignore(true)
            .compile()
            .unwrap();
        let filter = IgnoreFilter::new(dir.path(), &policy);
        assert!(filter.should_ignore(&dir.path().join("generated"), true));
        assert!(!filter.should_ignore(&dir.path().join("src"), true));

        let off = LimitsPolicy::default().compile().unwrap();
        let filter = IgnoreFilter::new(dir.path(), &off);
        assert!(!filter.should_ignore(&dir.path().join("generated"), true));
    }
}
