use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use crossbeam_channel::Sender;
use nmt_runner::{
    CommandCapturer, ConfigError, ConsoleProgress, Coordinator, FailurePolicy, HarnessSettings,
    ProgressObserver, RunConfig, RunError, RunReport, SilentProgress, SnapshotRecord,
    TerminationReason, ThumbnailWork,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_TASK_FAILURE: i32 = 101;
const EXIT_TIMEOUT: i32 = 124;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "nmt-probe",
    version,
    about = "Parallel load harness with native memory snapshots",
    after_help = "Snapshots are written as nmt-{baseline,periodic,final}-<timestamp>.{log,err}."
)]
struct Cli {
    /// Number of worker threads
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    workers: u32,
    /// Number of task invocations
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    invocations: u64,
    /// File every invocation processes
    subject: PathBuf,
    /// Periodic snapshot interval in seconds (0 disables periodic snapshots)
    #[arg(default_value_t = 0)]
    interval_seconds: u64,
    /// YAML settings file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    #[arg(long)]
    completion_timeout_secs: Option<u64>,
    /// Log failed tasks and keep running instead of aborting
    #[arg(long)]
    keep_going: bool,
    #[arg(long)]
    rotate: Option<u32>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug)]
struct Prepared {
    config: RunConfig,
    settings: HarnessSettings,
}

fn main() -> Result<()> {
    let cli = parse_cli();
    init_logging();

    let prepared = match prepare(&cli) {
        Ok(prepared) => prepared,
        Err(err) => {
            if cli.json {
                emit_json(&json_error("invalid_configuration", err.to_string()));
            } else {
                eprintln!("Error: {}", err);
                eprintln!("{}", Cli::command().render_usage());
            }
            std::process::exit(EXIT_CONFIG);
        }
    };

    let pid = std::process::id();
    if cli.json {
        info!(pid, "harness started");
    } else {
        println!("PID: {}", pid);
    }

    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(1);
    let relay = InterruptRelay::new(interrupt_tx);
    ctrlc::set_handler(move || {
        if !relay.relay() {
            eprintln!("\nSecond interrupt received, exiting immediately.");
            std::process::exit(EXIT_INTERRUPTED);
        }
    })
    .context("failed to install interrupt handler")?;

    let settings = &prepared.settings;
    let capturer = CommandCapturer::new(settings.snapshot.command.clone()).with_pid(pid);
    let work = ThumbnailWork::new()
        .with_rotation(settings.work.rotate_degrees)
        .with_artifact_dir(settings.work.artifact_dir.clone());
    let progress: Arc<dyn ProgressObserver> = if cli.json {
        Arc::new(SilentProgress)
    } else {
        Arc::new(ConsoleProgress)
    };
    let coordinator = Coordinator::new(
        prepared.config,
        settings.run_options(),
        Arc::new(capturer),
        Arc::new(work),
    )
    .with_interrupt(interrupt_rx)
    .with_progress(progress);

    let code = match coordinator.run() {
        Ok(report) => {
            let code = exit_code(&report);
            if cli.json {
                emit_json(&report_to_json(&report, pid, code));
            } else {
                print_report(&report);
            }
            code
        }
        Err(RunError::TaskFailed { failure, completed }) => {
            if cli.json {
                emit_json(&json!({
                    "ok": false,
                    "error": {
                        "code": "task_failed",
                        "message": failure.message,
                        "details": { "worker": failure.worker, "completed": completed }
                    }
                }));
            } else {
                eprintln!("\nFatal task failure on {}: {}", failure.worker, failure.message);
                eprintln!("Tasks completed before failure: {}", completed);
            }
            EXIT_TASK_FAILURE
        }
        Err(err) => return Err(err.into()),
    };
    std::process::exit(code)
}

/// Forwards the first Ctrl-C to the run as a cancellation request.
struct InterruptRelay {
    tx: Sender<()>,
    requested: AtomicBool,
}

impl InterruptRelay {
    fn new(tx: Sender<()>) -> Self {
        Self {
            tx,
            requested: AtomicBool::new(false),
        }
    }

    /// Returns `false` when a cancellation was already requested, in which
    /// case the caller should stop waiting for a graceful shutdown.
    fn relay(&self) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.try_send(());
        true
    }
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => err.exit(),
            _ => {
                let _ = err.print();
                std::process::exit(EXIT_CONFIG);
            }
        },
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Layers CLI flags over the settings file and validates the run.
fn prepare(cli: &Cli) -> Result<Prepared, ConfigError> {
    let mut settings = match &cli.config {
        Some(path) => HarnessSettings::load(path)?,
        None => HarnessSettings::default(),
    };
    if let Some(dir) = &cli.snapshot_dir {
        settings.snapshot.dir = dir.clone();
    }
    if let Some(secs) = cli.completion_timeout_secs {
        settings.completion_timeout_secs = secs;
    }
    if cli.keep_going {
        settings.failure_policy = FailurePolicy::Continue;
    }
    if cli.rotate.is_some() {
        settings.work.rotate_degrees = cli.rotate;
    }
    settings.validate()?;
    let config = RunConfig::new(
        cli.workers as usize,
        cli.invocations,
        &cli.subject,
        Duration::from_secs(cli.interval_seconds),
    )?;
    Ok(Prepared { config, settings })
}

fn exit_code(report: &RunReport) -> i32 {
    if report.interruption_pending() {
        return EXIT_INTERRUPTED;
    }
    match report.reason {
        TerminationReason::NormalCompletion => EXIT_OK,
        TerminationReason::Timeout => EXIT_TIMEOUT,
        TerminationReason::Interrupted => EXIT_INTERRUPTED,
    }
}

fn print_report(report: &RunReport) {
    match report.reason {
        TerminationReason::NormalCompletion => {
            println!("\nAll tasks completed. Final count: {}", report.completed);
            println!("Processed subject file: {}", report.subject.display());
        }
        TerminationReason::Timeout => {
            eprintln!("\nTimeout while waiting for tasks to complete.");
            eprintln!(
                "Completed: {}, discarded: {}",
                report.completed, report.discarded
            );
        }
        TerminationReason::Interrupted => {
            eprintln!("\nInterrupted while waiting for tasks to complete.");
            eprintln!(
                "Completed: {}, discarded: {}",
                report.completed, report.discarded
            );
        }
    }
    if report.failed > 0 {
        eprintln!("Failed tasks: {}", report.failed);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": {}
        }
    })
}

fn snapshot_to_json(record: &SnapshotRecord) -> Value {
    json!({
        "tag": record.kind.tag(),
        "description": record.description,
        "succeeded": record.succeeded,
        "log": record.targets.as_ref().map(|t| t.output.display().to_string()),
        "err": record.targets.as_ref().map(|t| t.error.display().to_string()),
    })
}

fn report_to_json(report: &RunReport, pid: u32, exit_code: i32) -> Value {
    json!({
        "ok": exit_code == EXIT_OK,
        "command": "run",
        "pid": pid,
        "reason": report.reason.as_str(),
        "completed": report.completed,
        "failed": report.failed,
        "discarded": report.discarded,
        "subject": report.subject.display().to_string(),
        "elapsed_secs": report.elapsed.as_secs_f64(),
        "interrupted_during_shutdown": report.interrupted_during_shutdown,
        "snapshots": report.snapshots.iter().map(snapshot_to_json).collect::<Vec<_>>(),
        "exit_code": exit_code,
    })
}
