use anyhow::Context;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use mta_rust_importaudit_core::{
    format_output, scan, ImportScanner, LimitsPolicy, OutputFormat, ScanOutcome, ScanProgress,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when the scan session ends aborted
const EXIT_ABORTED: i32 = 2;

#[derive(Parser)]
#[command(name = "importaudit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Audit import usage across an untrusted Python source tree")]
#[command(long_about = "Scans a directory of Python scripts that may be malformed, adversarial \
    or huge, and reports which modules they import. Every file passes path, size and content \
    checks before it is sanitized and parsed with bounded effort. Suspicious imports are \
    flagged, and the scan stops cleanly at the configured deadline or memory ceiling.\n\n\
    Limits come from a TOML policy file (--policy); flags below override individual keys.")]
pub struct Args {
    /// Directory to scan
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Summary)]
    pub format: OutputFormatArg,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Limits policy file (TOML)
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Maximum worker threads
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Maximum number of files to scan
    #[arg(long)]
    pub max_files: Option<usize>,

    /// Abort the scan after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Reject files importing suspicious modules instead of flagging them
    #[arg(long)]
    pub block_suspicious: bool,

    /// Skip files matched by the root's .gitignore
    #[arg(long)]
    pub respect_gitignore: bool,

    /// Load the parse cache from this file and save it back after the scan
    #[arg(long)]
    pub cache_snapshot: Option<PathBuf>,

    /// Show progress and informational logs
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Summary,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Yaml => OutputFormat::Yaml,
            OutputFormatArg::Summary => OutputFormat::Summary,
        }
    }
}

fn init_logging(verbose: bool) {
    // RUST_LOG wins; stdout is reserved for the report
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_policy(args: &Args) -> anyhow::Result<LimitsPolicy> {
    let mut limits = match &args.policy {
        Some(path) => {
            let source = fs::read_to_string(path)
                .with_context(|| format!("reading policy {}", path.display()))?;
            LimitsPolicy::from_toml_str(&source)
                .with_context(|| format!("parsing policy {}", path.display()))?
        }
        None => LimitsPolicy::default(),
    };

    if let Some(workers) = args.max_workers {
        limits = limits.with_max_workers(workers);
    }
    if let Some(files) = args.max_files {
        limits = limits.with_max_files(files);
    }
    if let Some(secs) = args.timeout {
        limits = limits.with_max_scan_duration(Duration::from_secs(secs));
    }
    if args.block_suspicious {
        limits = limits.with_block_suspicious_imports(true);
    }
    if args.respect_gitignore {
        limits = limits.with_respect_gitignore(true);
    }

    Ok(limits)
}

fn write_output(outcome: &ScanOutcome, args: &Args) -> anyhow::Result<()> {
    let output = format_output(outcome, args.format.clone().into())?;

    if let Some(path) = &args.output {
        fs::write(path, &output).with_context(|| format!("writing {}", path.display()))?;
        info!("Output written to: {}", path.display());
    } else {
        println!("{}", output);
    }

    Ok(())
}

fn progress_bar(verbose: bool) -> Option<ProgressBar> {
    if !verbose {
        return None;
    }

    let pb = ProgressBar::new(0);
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} files")
    {
        Ok(style) => pb.set_style(style),
        Err(e) => warn!("Invalid progress template: {}", e),
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

fn run_scan(scanner: &ImportScanner, root: &Path, verbose: bool) -> ScanOutcome {
    let bar = progress_bar(verbose);

    let outcome = scanner.scan_with_progress(root, &|progress: ScanProgress| {
        if let Some(pb) = &bar {
            pb.set_length(progress.files_total as u64);
            pb.set_position(progress.files_done as u64);
        }
    });

    if let Some(pb) = bar {
        let report = outcome.report();
        pb.finish_with_message(format!(
            "Scanned {} files in {}ms",
            report.files_scanned, report.elapsed_ms
        ));
    }

    outcome
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let limits = load_policy(&args)?;

    let scanner = match ImportScanner::new(limits.clone()) {
        Ok(scanner) => scanner,
        Err(_) => {
            // Render the aborted session the same way as any other outcome
            let outcome = scan(&args.path, limits);
            write_output(&outcome, &args)?;
            std::process::exit(EXIT_ABORTED);
        }
    };

    if let Some(snapshot) = &args.cache_snapshot {
        match scanner.load_cache_snapshot(snapshot) {
            Ok(loaded) => info!(loaded, "Loaded cache snapshot"),
            Err(e) => warn!("Ignoring cache snapshot {}: {}", snapshot.display(), e),
        }
    }

    let outcome = run_scan(&scanner, &args.path, args.verbose);

    if let Some(snapshot) = &args.cache_snapshot {
        match scanner.save_cache_snapshot(snapshot) {
            Ok(saved) => info!(saved, "Saved cache snapshot"),
            Err(e) => warn!("Failed to save cache snapshot {}: {}", snapshot.display(), e),
        }
    }

    write_output(&outcome, &args)?;

    if outcome.is_aborted() {
        std::process::exit(EXIT_ABORTED);
    }
    Ok(())
}
