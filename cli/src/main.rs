//! Keepsafe - Command-line interface for the backup engine.
//!
//! Runs one backup job, either described by flags or loaded from a JSON job
//! file, and reports progress to stderr.
//!
//! Exit codes: 0 completed, 1 completed with errors, 2 failed or invalid
//! input, 130 interrupted.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use keepsafe_engine::{
    CancellationToken, ConflictPolicy, EngineSettings, EnumerationWarning, JobDefinition,
    JobResult, JobRunner, JobState, PlanAction, ProgressEvent,
    RecordSink, TargetDescriptor, TransferResult,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Keepsafe - verified, atomic file backups
#[derive(Parser, Debug)]
#[command(name = "keepsafe")]
#[command(version)]
#[command(about = "Back up files with checksum verification and atomic writes")]
struct Args {
    /// Job definition file (JSON). Other flags override its fields.
    #[arg(long, value_name = "FILE")]
    job: Option<PathBuf>,

    /// Source file or directory (repeatable)
    #[arg(long, value_name = "PATH")]
    src: Vec<PathBuf>,

    /// Backup target directory
    #[arg(long, value_name = "PATH")]
    dst: Option<PathBuf>,

    /// Job name
    #[arg(long, default_value = "backup")]
    name: String,

    /// Include patterns, e.g. "*.docx;*.xlsx"
    #[arg(long, value_name = "GLOBS")]
    include: Option<String>,

    /// Exclude patterns, e.g. "*/temp/*;*.tmp"
    #[arg(long, value_name = "GLOBS")]
    exclude: Option<String>,

    /// Conflict policy: overwrite, rename, or skip
    #[arg(long, value_name = "POLICY")]
    policy: Option<String>,

    /// Engine settings file (JSON)
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Checksum algorithm: sha256 or blake3
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<String>,

    /// Only back up this relative path (repeatable)
    #[arg(long, value_name = "RELATIVE_PATH")]
    only: Vec<String>,

    /// Show what would be written without writing
    #[arg(long)]
    dry_run: bool,

    /// Print the result as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Remove staging files left by interrupted runs before starting
    #[arg(long)]
    sweep: bool,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

/// What a CLI invocation ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Planned,
    Finished(JobState),
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Outcome::Planned => 0,
            Outcome::Finished(JobState::Completed) => 0,
            Outcome::Finished(JobState::CompletedWithErrors) => 1,
            Outcome::Finished(JobState::Aborted) => 130,
            Outcome::Finished(_) => 2,
        }
    }
}

/// CLI implementation of RecordSink for displaying backup progress
struct CliSink {
    verbose: bool,
    quiet: bool,
    start_time: Instant,
    last_progress_update: Mutex<Instant>,
}

impl CliSink {
    fn new(verbose: bool, quiet: bool) -> Self {
        let now = Instant::now();
        CliSink {
            verbose,
            quiet,
            start_time: now,
            last_progress_update: Mutex::new(now),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

impl RecordSink for CliSink {
    fn on_progress(&self, event: &ProgressEvent) {
        if self.quiet || self.verbose {
            return;
        }
        // Throttle progress updates to avoid spam (max once per 200ms)
        let mut last = self
            .last_progress_update
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if last.elapsed() < Duration::from_millis(200) {
            return;
        }
        *last = Instant::now();

        eprint!(
            "\rProgress: {} files | {}",
            event.items_done,
            Self::format_bytes(event.bytes_done)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_item_result(&self, result: &TransferResult) {
        if self.quiet {
            return;
        }
        if self.verbose || result.status().is_failure() {
            let destination = match result.action() {
                PlanAction::RenameTo(_) => format!(" -> {}", result.destination().display()),
                _ => String::new(),
            };
            eprintln!(
                "[{:>19}] {}{}",
                result.status().to_string(),
                result.relative_path(),
                destination
            );
        }
    }

    fn on_warning(&self, warning: &EnumerationWarning) {
        if !self.quiet {
            eprintln!("warning: {}: {}", warning.path.display(), warning.message);
        }
    }

    fn on_job_result(&self, result: &JobResult) {
        if self.quiet {
            return;
        }
        eprintln!();
        match result.status() {
            JobState::Completed => eprintln!("Backup complete!"),
            JobState::CompletedWithErrors => eprintln!("Backup complete with errors."),
            JobState::Aborted => eprintln!("Backup interrupted."),
            _ => eprintln!("Backup failed."),
        }
        if let Some(error) = result.error() {
            eprintln!("  {}", error);
        }

        eprintln!(
            "Summary: {} written, {} skipped, {} failed",
            result.files_written(),
            result.files_skipped(),
            result.files_failed()
        );
        if !result.warnings().is_empty() {
            eprintln!("Warnings: {}", result.warnings().len());
        }
        eprintln!("Bytes copied: {}", Self::format_bytes(result.bytes_transferred()));
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if result.files_failed() > 0 {
            eprintln!();
            eprintln!("Failed files:");
            for item in result.items().iter().filter(|i| i.status().is_failure()) {
                eprintln!(
                    "  {}: {}",
                    item.relative_path(),
                    item.error().unwrap_or("(unknown error)")
                );
            }
        }
    }
}

/// Parse arguments, set up logging and interrupt handling, then run
fn main() {
    let args = Args::parse();

    if let Err(e) = setup_logging(args.verbose) {
        eprintln!("Warning: {:#}", e);
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing current file...");
        handler_token.cancel();
    }) {
        warn!(error = %e, "failed to set interrupt handler");
    }

    let exit_code = match run_cli(&args, &cancel) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "keepsafe=debug,warn" } else { "keepsafe=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {}", e))
}

/// Build the job definition from a job file and/or flags
fn build_job(args: &Args) -> Result<JobDefinition> {
    let mut job = match &args.job {
        Some(path) => JobDefinition::from_json_file(path)?,
        None => {
            if args.src.is_empty() {
                bail!("at least one --src is required unless --job is given");
            }
            let dst = args
                .dst
                .clone()
                .context("--dst is required unless --job is given")?;
            JobDefinition::new(
                args.name.clone(),
                args.src.clone(),
                TargetDescriptor::local(dst),
                ConflictPolicy::Rename,
            )
        }
    };

    if args.job.is_some() {
        if !args.src.is_empty() {
            job.sources = args.src.clone();
        }
        if let Some(dst) = &args.dst {
            job.target = TargetDescriptor::local(dst);
        }
    }
    if let Some(include) = &args.include {
        job.include = include.parse()?;
    }
    if let Some(exclude) = &args.exclude {
        job.exclude = exclude.parse()?;
    }
    if let Some(policy) = &args.policy {
        job.conflict_policy = policy.parse()?;
    }
    if !args.only.is_empty() {
        job = job.restricted_to(args.only.iter().cloned());
    }
    Ok(job)
}

fn load_settings(args: &Args) -> Result<EngineSettings> {
    let mut settings = match &args.settings {
        Some(path) => EngineSettings::load(path)?,
        None => EngineSettings::default(),
    };
    if let Some(hash) = &args.hash {
        settings.checksum_algorithm = hash.parse()?;
    }
    Ok(settings)
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args, cancel: &CancellationToken) -> Result<Outcome> {
    let job = build_job(args)?;
    let settings = load_settings(args)?;

    let runner = JobRunner::for_target(job, settings).context("invalid job")?;

    if args.sweep {
        let connector = runner.connector();
        let removed = connector
            .sweep_staging()
            .context("failed to sweep staging files")?;
        info!(removed, target = %connector.root().display(), "swept orphaned staging files");
    }

    if args.dry_run {
        let plan = runner.plan().context("planning failed")?;
        print_plan(&plan, args.json)?;
        return Ok(Outcome::Planned);
    }

    let sink = CliSink::new(args.verbose, args.json);
    let result = runner.run(&sink, cancel);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(Outcome::Finished(result.status()))
}

fn print_plan(plan: &[keepsafe_engine::PlanItem], json: bool) -> Result<()> {
    if json {
        let entries: Vec<serde_json::Value> = plan
            .iter()
            .map(|item| {
                serde_json::json!({
                    "source": item.candidate.source_path,
                    "destination": item.destination,
                    "action": item.action,
                    "size": item.candidate.size,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let mut writes = 0;
    for item in plan {
        let label = match item.action {
            PlanAction::Write if item.replace_existing => "overwrite",
            PlanAction::Write => "write",
            PlanAction::Skip => "skip",
            PlanAction::RenameTo(_) => "rename",
        };
        if item.action.writes() {
            writes += 1;
        }
        println!(
            "{:<9} {} -> {}",
            label,
            item.candidate.relative_str(),
            item.destination.display()
        );
    }
    println!("{} of {} files would be written", writes, plan.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["keepsafe"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).expect("Failed to parse args")
    }

    fn path_arg(path: &std::path::Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_cli_with_valid_directories() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(src_dir.path().join("test.txt"), "hello").expect("Failed to write file");

        let src = path_arg(src_dir.path());
        let dst = path_arg(dst_dir.path());
        let args = parse(&["--src", &src, "--dst", &dst, "--policy", "skip"]);

        let outcome = run_cli(&args, &CancellationToken::new()).expect("CLI should succeed");
        assert_eq!(outcome, Outcome::Finished(JobState::Completed));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(fs::read_to_string(dst_dir.path().join("test.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_cli_with_filters_and_blake3() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(src_dir.path().join("temp")).unwrap();
        fs::write(src_dir.path().join("a.txt"), "a").unwrap();
        fs::write(src_dir.path().join("temp/b.tmp"), "b").unwrap();

        let src = path_arg(src_dir.path());
        let dst = path_arg(dst_dir.path());
        let args = parse(&[
            "--src", &src, "--dst", &dst, "--include", "*.txt", "--exclude", "*/temp/*;*.tmp",
            "--hash", "blake3",
        ]);

        let outcome = run_cli(&args, &CancellationToken::new()).unwrap();
        assert_eq!(outcome, Outcome::Finished(JobState::Completed));
        assert!(dst_dir.path().join("a.txt").exists());
        assert!(!dst_dir.path().join("temp").exists());
    }

    #[test]
    fn test_cli_missing_source_fails_the_job() {
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let dst = path_arg(dst_dir.path());
        let args = parse(&["--src", "/nonexistent/keepsafe/source", "--dst", &dst]);

        let outcome = run_cli(&args, &CancellationToken::new()).unwrap();
        assert_eq!(outcome, Outcome::Finished(JobState::Failed));
        assert_eq!(outcome.exit_code(), 2);
    }

    #[test]
    fn test_cli_requires_src_and_dst_without_job() {
        let args = parse(&["--dst", "/tmp/somewhere"]);
        assert!(run_cli(&args, &CancellationToken::new()).is_err());

        let args = parse(&["--src", "/tmp"]);
        let err = run_cli(&args, &CancellationToken::new()).unwrap_err();
        assert!(err.to_string().contains("--dst"));
    }

    #[test]
    fn test_cli_rejects_invalid_policy() {
        let args = parse(&["--src", "/tmp", "--dst", "/tmp/out", "--policy", "ask"]);
        let err = run_cli(&args, &CancellationToken::new()).unwrap_err();
        assert!(err.to_string().contains("ask"));
    }

    #[test]
    fn test_cli_rejects_invalid_hash_algorithm() {
        let args = parse(&["--src", "/tmp", "--dst", "/tmp/out", "--hash", "md5"]);
        assert!(run_cli(&args, &CancellationToken::new()).is_err());
    }

    #[test]
    fn test_cli_rejects_invalid_pattern() {
        let args = parse(&["--src", "/tmp", "--dst", "/tmp/out", "--include", "[oops"]);
        let err = run_cli(&args, &CancellationToken::new()).unwrap_err();
        assert!(format!("{:#}", err).contains("[oops"));
    }

    #[test]
    fn test_cli_dry_run_writes_nothing() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(src_dir.path().join("a.txt"), "a").unwrap();

        let src = path_arg(src_dir.path());
        let dst = path_arg(dst_dir.path());
        let args = parse(&["--src", &src, "--dst", &dst, "--dry-run"]);

        let outcome = run_cli(&args, &CancellationToken::new()).unwrap();
        assert_eq!(outcome, Outcome::Planned);
        assert!(!dst_dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_cli_interrupted_run_exits_130() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(src_dir.path().join("a.txt"), "a").unwrap();

        let src = path_arg(src_dir.path());
        let dst = path_arg(dst_dir.path());
        let args = parse(&["--src", &src, "--dst", &dst]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run_cli(&args, &cancel).unwrap();
        assert_eq!(outcome, Outcome::Finished(JobState::Aborted));
        assert_eq!(outcome.exit_code(), 130);
    }

    #[test]
    fn test_cli_job_file_with_overrides() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("keep.txt"), "keep").unwrap();
        fs::write(src.join("other.txt"), "other").unwrap();

        let job_file = temp.path().join("job.json");
        let job = serde_json::json!({
            "name": "nightly",
            "sources": [src],
            "target": { "location": dst },
            "conflict_policy": "skip"
        });
        fs::write(&job_file, job.to_string()).unwrap();

        let job_arg = path_arg(&job_file);
        let args = parse(&["--job", &job_arg, "--only", "keep.txt", "--json"]);

        let outcome = run_cli(&args, &CancellationToken::new()).unwrap();
        assert_eq!(outcome, Outcome::Finished(JobState::Completed));
        assert!(dst.join("keep.txt").exists());
        assert!(!dst.join("other.txt").exists());
    }

    #[test]
    fn test_cli_sweep_removes_orphaned_staging() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(src_dir.path().join("a.txt"), "a").unwrap();
        let orphan = dst_dir.path().join(".a.txt.0123456789ab.ks-partial");
        fs::write(&orphan, "half").unwrap();

        let src = path_arg(src_dir.path());
        let dst = path_arg(dst_dir.path());
        let args = parse(&["--src", &src, "--dst", &dst, "--sweep"]);

        run_cli(&args, &CancellationToken::new()).unwrap();
        assert!(!orphan.exists());
        assert!(dst_dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::Finished(JobState::CompletedWithErrors).exit_code(), 1);
        assert_eq!(Outcome::Planned.exit_code(), 0);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(CliSink::format_bytes(512), "512.00 B");
        assert_eq!(CliSink::format_bytes(1536), "1.50 KB");
        assert_eq!(CliSink::format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(CliSink::format_duration(Duration::from_secs(42)), "42s");
    }
}
