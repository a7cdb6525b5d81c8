//! MTA Rust ImportAudit Core Library
//!
//! Scans a directory tree of untrusted Python scripts, extracts their import
//! declarations and aggregates usage statistics under a frozen limits policy.
//!
//! # Features
//!
//! - Path, size and content gates applied before any parsing
//! - Sanitization of raw content (control characters, line endings)
//! - Bounded tree-sitter parsing with a node limit and a parse timeout
//! - LRU + TTL result cache keyed by path, size and modification time
//! - Adaptive worker/batch planning from throughput history
//! - Deadline and memory-ceiling enforcement with partial results on abort
//! - Output in JSON, YAML or a human-readable summary
//!
//! # Example
//!
//! ```no_run
//! use mta_rust_importaudit_core::{format_output, ImportScanner, LimitsPolicy, OutputFormat};
//! use std::path::Path;
//!
//! let scanner = ImportScanner::new(LimitsPolicy::default()).unwrap();
//! let outcome = scanner.scan(Path::new("."));
//!
//! let json = format_output(&outcome, OutputFormat::Json).unwrap();
//! println!("{}", json);
//! ```

pub mod cache;
pub mod config;
pub mod models;
pub mod monitor;
pub mod output;
pub mod parsers;
pub mod sanitizer;
pub mod scanner;
pub mod scheduler;
pub mod session;
pub mod validator;

// Re-exports for convenience
pub use cache::{CacheError, CacheKey, ResultCache};
pub use config::{LimitsPolicy, Policy, PolicyError};
pub use models::*;
pub use output::{format_output, format_summary, FormatError, OutputFormat};
pub use parsers::parse_imports;
pub use sanitizer::sanitize;
pub use scanner::{scan, ImportScanner};
pub use validator::{validate_content, validate_imports, validate_path, validate_size, Rejection, ValidationVerdict};
