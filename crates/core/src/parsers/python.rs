use crate::models::ImportSet;
use tree_sitter::{Node, Parser, Tree};

use super::{ImportParser, ParseLimits, ParserError};

pub struct PythonParser {
    parser: Parser,
    limits: ParseLimits,
}

impl PythonParser {
    pub fn new(limits: ParseLimits) -> Result<Self, ParserError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| ParserError::InitError(e.to_string()))?;
        #[allow(deprecated)]
        parser.set_timeout_micros(limits.timeout.as_micros().min(u64::MAX as u128) as u64);

        Ok(Self { parser, limits })
    }

    /// Walk the tree with an explicit stack, pre-order, up to the node limit
    ///
    /// Every node counts against the limit, including the tokens inside
    /// import statements.
    fn extract_imports(&self, source: &str, tree: &Tree) -> ImportSet {
        let mut imports = ImportSet::default();
        let mut pending = vec![tree.root_node()];

        while let Some(node) = pending.pop() {
            if imports.nodes_visited >= self.limits.max_nodes {
                imports.truncated = true;
                break;
            }
            imports.nodes_visited += 1;

            match node.kind() {
                "future_import_statement" => self.insert(&mut imports, "__future__".to_string()),
                "dotted_name" if is_imported_module(&node) => {
                    if let Some(module) = self.dotted_name(&node, source) {
                        self.insert(&mut imports, module);
                    }
                }
                _ => {}
            }

            for i in (0..node.child_count()).rev() {
                if let Some(child) = node.child(i) {
                    pending.push(child);
                }
            }
        }

        imports
    }

    /// Join the identifiers of a dotted name, ignoring whitespace and comments
    fn dotted_name(&self, node: &Node, source: &str) -> Option<String> {
        let mut cursor = node.walk();
        let parts: Vec<&str> = node
            .children(&mut cursor)
            .filter(|c| c.kind() == "identifier")
            .filter_map(|c| c.utf8_text(source.as_bytes()).ok())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("."))
        }
    }

    fn insert(&self, imports: &mut ImportSet, module: String) {
        let module = if self.limits.top_level_only {
            match module.split_once('.') {
                Some((top, _)) => top.to_string(),
                None => module,
            }
        } else {
            module
        };
        imports.modules.insert(module);
    }
}

/// Whether a `dotted_name` names the module of an import
///
/// Covers `import a.b`, `import a.b as c` and `from a.b import c`. Names
/// imported from a module and relative imports do not count.
fn is_imported_module(node: &Node) -> bool {
    let Some(parent) = node.parent() else {
        return false;
    };
    match parent.kind() {
        "import_statement" => true,
        "import_from_statement" => parent.child_by_field_name("module_name") == Some(*node),
        "aliased_import" => {
            parent.child_by_field_name("name") == Some(*node)
                && parent
                    .parent()
                    .is_some_and(|grandparent| grandparent.kind() == "import_statement")
        }
        _ => false,
    }
}

/// Position of the first error or missing node, descending only into
/// subtrees that contain one
fn first_error(tree: &Tree) -> Option<(usize, usize)> {
    let mut pending = vec![tree.root_node()];
    while let Some(node) = pending.pop() {
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            return Some((pos.row + 1, pos.column));
        }
        for i in (0..node.child_count()).rev() {
            if let Some(child) = node.child(i) {
                if child.has_error() {
                    pending.push(child);
                }
            }
        }
    }
    None
}

impl ImportParser for PythonParser {
    fn parse_imports(&mut self, source: &str) -> Result<ImportSet, ParserError> {
        let Some(tree) = self.parser.parse(source, None) else {
            // A timed-out parse would otherwise resume on the next call
            self.parser.reset();
            return Err(ParserError::Timeout(self.limits.timeout));
        };

        if tree.root_node().has_error() {
            let (line, column) = first_error(&tree).unwrap_or((1, 0));
            return Err(ParserError::Syntax { line, column });
        }

        Ok(self.extract_imports(source, &tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> ParseLimits {
        ParseLimits {
            max_nodes: 100_000,
            timeout: Duration::from_secs(5),
            top_level_only: true,
        }
    }

    fn parse(source: &str) -> ImportSet {
        PythonParser::new(limits()).unwrap().parse_imports(source).unwrap()
    }

    #[test]
    fn test_simple_import() {
        let imports = parse("import os\nimport sys");

        assert_eq!(imports.len(), 2);
        assert!(imports.contains("os"));
        assert!(imports.contains("sys"));
        assert!(!imports.truncated);
    }

    #[test]
    fn test_import_with_alias() {
        let imports = parse("import numpy as np, pandas");

        assert_eq!(imports.len(), 2);
        assert!(imports.contains("numpy"));
        assert!(imports.contains("pandas"));
        assert!(!imports.contains("np"));
    }

    #[test]
    fn test_from_import() {
        let imports = parse("from typing import List, Dict\nfrom foo.bar.baz import qux");

        assert_eq!(imports.len(), 2);
        assert!(imports.contains("typing"));
        assert!(imports.contains("foo"));
    }

    #[test]
    fn test_full_dotted_names() {
        let mut parser = PythonParser::new(ParseLimits {
            top_level_only: false,
            ..limits()
        })
        .unwrap();
        let imports = parser
            .parse_imports("import foo.bar.baz\nfrom os.path import join")
            .unwrap();

        assert!(imports.contains("foo.bar.baz"));
        assert!(imports.contains("os.path"));
    }

    #[test]
    fn test_relative_import_skipped() {
        let imports = parse("from . import utils\nfrom ..config import Settings\nimport json");

        assert_eq!(imports.len(), 1);
        assert!(imports.contains("json"));
    }

    #[test]
    fn test_future_import() {
        let imports = parse("from __future__ import annotations\n");
        assert!(imports.contains("__future__"));
    }

    #[test]
    fn test_nested_imports() {
        let source = "def load():\n    try:\n        import yaml\n    except ImportError:\n        from json import loads\n";
        let imports = parse(source);

        assert!(imports.contains("yaml"));
        assert!(imports.contains("json"));
    }

    #[test]
    fn test_no_imports() {
        let imports = parse("x = 1\n");
        assert!(imports.is_empty());
        assert!(!imports.truncated);
        assert!(imports.nodes_visited > 0);
    }

    #[test]
    fn test_truncated_walk_keeps_partial_set() {
        let mut source = String::from("import os\nimport numpy\n");
        for i in 0..200 {
            source.push_str(&format!("value_{} = {} + {}\n", i, i, i));
        }
        source.push_str("import late_module\n");

        let mut parser = PythonParser::new(ParseLimits {
            max_nodes: 20,
            ..limits()
        })
        .unwrap();
        let imports = parser.parse_imports(&source).unwrap();

        assert!(imports.truncated);
        assert!(!imports.is_empty());
        assert!(imports.contains("os"));
        assert!(!imports.contains("late_module"));
        assert_eq!(imports.nodes_visited, 20);
    }

    #[test]
    fn test_import_list_counts_against_node_limit() {
        let source = "import a, b, c, d, e, f, g, h\n";
        let full = parse(source);
        assert_eq!(full.len(), 8);
        assert!(full.nodes_visited > 8);

        let mut parser = PythonParser::new(ParseLimits {
            max_nodes: 3,
            ..limits()
        })
        .unwrap();
        let imports = parser.parse_imports(source).unwrap();
        assert!(imports.truncated);
        assert_eq!(imports.nodes_visited, 3);

        let mut parser = PythonParser::new(ParseLimits {
            max_nodes: 6,
            ..limits()
        })
        .unwrap();
        let imports = parser.parse_imports(source).unwrap();
        assert!(imports.truncated);
        assert!(imports.contains("a"));
        assert!(!imports.contains("h"));
    }

    #[test]
    fn test_imported_names_are_not_modules() {
        let imports = parse("from pkg import helper as h, other\nfrom .local import thing\n");

        assert_eq!(imports.len(), 1);
        assert!(imports.contains("pkg"));
    }

    #[test]
    fn test_exact_limit_is_not_truncated() {
        let source = "import os\n";
        let visited = parse(source).nodes_visited;

        let mut parser = PythonParser::new(ParseLimits {
            max_nodes: visited,
            ..limits()
        })
        .unwrap();
        assert!(!parser.parse_imports(source).unwrap().truncated);
    }

    #[test]
    fn test_syntax_error() {
        let mut parser = PythonParser::new(limits()).unwrap();
        let err = parser.parse_imports("import os\ndef broken(:\n    pass\n").unwrap_err();
        assert!(matches!(err, ParserError::Syntax { .. }));

        // The parser stays usable after a failure
        assert!(parser.parse_imports("import os\n").unwrap().contains("os"));
    }

    #[test]
    fn test_deep_nesting_does_not_overflow() {
        let depth = 1000;
        let source = format!(
            "import numpy\nx = {}1{}\n",
            "(".repeat(depth),
            ")".repeat(depth)
        );
        let imports = parse(&source);
        assert!(imports.contains("numpy"));
    }
}
