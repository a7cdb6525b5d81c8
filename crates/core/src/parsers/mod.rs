mod python;

pub use python::PythonParser;

use crate::config::Policy;
use crate::models::ImportSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    #[error("Failed to initialize parser: {0}")]
    InitError(String),
    #[error("Syntax error at line {line}, column {column}")]
    Syntax { line: usize, column: usize },
    #[error("Parse exceeded {0:?}")]
    Timeout(Duration),
}

/// Structural bounds for one parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Syntax nodes visited before the walk is truncated
    pub max_nodes: usize,
    /// Wall-clock bound on building the syntax tree
    pub timeout: Duration,
    /// Record `a.b.c` as `a`
    pub top_level_only: bool,
}

impl ParseLimits {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            max_nodes: policy.limits().max_parse_nodes,
            timeout: policy.parse_timeout(),
            top_level_only: policy.limits().top_level_only,
        }
    }
}

/// Trait for bounded import extractors
pub trait ImportParser {
    /// Extract import declarations from sanitized source
    ///
    /// Hitting the node limit is not an error: the partial set comes back
    /// with `truncated` set.
    fn parse_imports(&mut self, source: &str) -> Result<ImportSet, ParserError>;
}

/// Create the parser used for scanned scripts
pub fn create_parser(limits: ParseLimits) -> Result<Box<dyn ImportParser + Send>, ParserError> {
    Ok(Box::new(PythonParser::new(limits)?))
}

/// One-shot parse with limits taken from `policy`
pub fn parse_imports(content: &str, policy: &Policy) -> Result<ImportSet, ParserError> {
    PythonParser::new(ParseLimits::from_policy(policy))?.parse_imports(content)
}
