mod json;
mod yaml;

pub use json::{to_json, to_json_compact};
pub use yaml::to_yaml;

use crate::models::{ScanOutcome, ScanReport};
use std::fmt::Write;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
    Summary,
}

/// Format a scan outcome according to the specified format
pub fn format_output(outcome: &ScanOutcome, format: OutputFormat) -> Result<String, FormatError> {
    match format {
        OutputFormat::Json => to_json(outcome),
        OutputFormat::Yaml => to_yaml(outcome),
        OutputFormat::Summary => Ok(format_summary(outcome)),
    }
}

/// Generate a human-readable summary
pub fn format_summary(outcome: &ScanOutcome) -> String {
    let report = outcome.report();
    let mut output = String::new();

    output.push_str(&format!(
        "Import Audit Summary\n\
         ====================\n\
         Root: {}\n",
        report.root.display()
    ));
    if let ScanOutcome::Aborted(aborted) = outcome {
        output.push_str(&format!(
            "Status: ABORTED during {} ({})\n",
            aborted.phase, aborted.reason
        ));
    } else {
        output.push_str("Status: completed\n");
    }
    output.push('\n');

    push_files(&mut output, report);
    push_modules(&mut output, report);
    push_security(&mut output, report);
    push_performance(&mut output, report);

    output.push_str(&format!(
        "Scan Duration: {}ms ({:.2} files/sec)\n\
         Timestamp: {}\n\
         Tool Version: {}\n",
        report.elapsed_ms,
        report.metadata.files_per_second,
        report.metadata.timestamp,
        report.metadata.tool_version
    ));

    output
}

fn push_files(output: &mut String, report: &ScanReport) {
    let _ = writeln!(output, "Candidates: {}", report.files_total);
    let _ = writeln!(output, "Files Scanned: {}", report.files_scanned);
    let _ = writeln!(output, "- Truncated: {}", report.truncated_files);
    if report.unprocessed_files > 0 {
        let _ = writeln!(output, "- Unprocessed: {}", report.unprocessed_files);
    }
    if let Some(stop) = report.enumeration_stopped {
        let _ = writeln!(output, "- Enumeration stopped: {:?}", stop);
    }

    let _ = writeln!(output, "Rejected: {}", report.total_rejected());
    for (kind, count) in &report.rejected {
        let _ = writeln!(output, "- {}: {}", kind, count);
    }
    output.push('\n');
}

fn push_modules(output: &mut String, report: &ScanReport) {
    let _ = writeln!(
        output,
        "Modules: {} ({} imports)",
        report.module_counts.len(),
        report.total_imports
    );
    for usage in &report.top_modules {
        let _ = writeln!(
            output,
            "  {:<30} {:>6} {:>6.1}%",
            usage.module, usage.count, usage.percentage
        );
    }
    if report.module_counts.len() > report.top_modules.len() {
        let _ = writeln!(
            output,
            "  ... and {} more",
            report.module_counts.len() - report.top_modules.len()
        );
    }
    output.push('\n');
}

fn push_security(output: &mut String, report: &ScanReport) {
    let security = &report.security;
    let _ = writeln!(
        output,
        "Security: {} files read ({} bytes), {} sanitized",
        security.files_processed, security.bytes_processed, security.sanitized_files
    );
    if security.flagged_files > 0 {
        let modules: Vec<String> = security
            .flagged_modules
            .iter()
            .map(|(module, count)| format!("{} ({})", module, count))
            .collect();
        let _ = writeln!(
            output,
            "Flagged Files: {} [{}]",
            security.flagged_files,
            modules.join(", ")
        );
    }
    for issue in security.issues.iter().take(20) {
        let _ = writeln!(
            output,
            "  {} {}: {}",
            issue.kind,
            issue.path.display(),
            issue.detail
        );
    }
    if security.issues.len() > 20 || security.issues_truncated {
        let _ = writeln!(output, "  ... more issues in the JSON report");
    }
    output.push('\n');
}

fn push_performance(output: &mut String, report: &ScanReport) {
    let perf = &report.performance;
    let _ = writeln!(
        output,
        "Cache: {} hits, {} misses ({:.1}% hit ratio, {}/{} entries)",
        perf.cache.hits,
        perf.cache.misses,
        perf.cache.hit_ratio * 100.0,
        perf.cache.size,
        perf.cache.capacity
    );
    let _ = writeln!(
        output,
        "Memory: {:.1} MiB peak, {} reclaims",
        report.peak_memory_bytes as f64 / (1024.0 * 1024.0),
        perf.reclaims
    );
    for (name, stats) in &perf.timings {
        let _ = writeln!(
            output,
            "  {:<12} n={:<6} mean={:.3}ms min={:.3}ms max={:.3}ms",
            name, stats.count, stats.mean_ms, stats.min_ms, stats.max_ms
        );
    }
    output.push('\n');
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AbortReason, AbortedReport, ModuleUsage, RejectionKind, SessionPhase};
    use std::path::PathBuf;

    fn report() -> ScanReport {
        let mut report = ScanReport {
            root: PathBuf::from("/project"),
            files_total: 3,
            files_scanned: 2,
            total_imports: 2,
            ..ScanReport::default()
        };
        report.module_counts.insert("numpy".to_string(), 2);
        report.top_modules.push(ModuleUsage {
            module: "numpy".to_string(),
            count: 2,
            percentage: 100.0,
        });
        report.rejected.insert(RejectionKind::ParseFailed, 1);
        report
    }

    #[test]
    fn test_summary_completed() {
        let summary = format_summary(&ScanOutcome::Completed(report()));

        assert!(summary.contains("Root: /project"));
        assert!(summary.contains("Status: completed"));
        assert!(summary.contains("Files Scanned: 2"));
        assert!(summary.contains("- ParseFailed: 1"));
        assert!(summary.contains("numpy"));
    }

    #[test]
    fn test_summary_aborted() {
        let outcome = ScanOutcome::Aborted(AbortedReport {
            reason: AbortReason::DeadlineExceeded { limit_ms: 10 },
            phase: SessionPhase::Scanning,
            partial: report(),
        });
        let summary = format_summary(&outcome);

        assert!(summary.contains("ABORTED during scanning"));
        assert!(summary.contains("10ms"));
    }

    #[test]
    fn test_format_output_dispatch() {
        let outcome = ScanOutcome::Completed(report());

        assert!(format_output(&outcome, OutputFormat::Json).unwrap().starts_with('{'));
        assert!(format_output(&outcome, OutputFormat::Yaml).unwrap().contains("status:"));
        assert!(format_output(&outcome, OutputFormat::Summary)
            .unwrap()
            .starts_with("Import Audit Summary"));
    }
}
