use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use events::ActivityEvent;
use futures::StreamExt;
use orchestrator::{
    AmendmentBus, EngineConfig, HttpBackend, LlmWorker, PlanRunner, ReasoningBackend, RunReplay,
    Scheduler, TraceSummarizer,
};
use taskflow_core::{JobConfig, JobStatus, RunMode, StepStatus};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STATUS_POLL: Duration = Duration::from_millis(500);
const SUMMARY_WAIT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "taskflow")]
#[command(about = "Plan, execute and verify multi-step goals", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Working directory holding `.taskflow/` and the run folders
    #[arg(short = 'C', long, global = true)]
    dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config to `.taskflow/config.json`
    Init,
    /// Run one goal to completion
    Run {
        goal: String,

        #[arg(long)]
        project: Option<String>,

        /// `standard` or `trace`
        #[arg(long)]
        mode: Option<String>,
    },
    /// Print what a trace file says happened
    Replay { trace_file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let work_dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Init => init_project(&work_dir).await,
        Commands::Run {
            goal,
            project,
            mode,
        } => {
            init_tracing();
            run_goal(&work_dir, &goal, project, mode.as_deref()).await
        }
        Commands::Replay { trace_file } => replay(&trace_file).await,
    }
}

async fn init_project(work_dir: &Path) -> Result<()> {
    let config_path = EngineConfig::config_path(work_dir);
    if config_path.exists() {
        println!("Already initialized: {}", config_path.display());
        return Ok(());
    }

    let mut config = EngineConfig::default();
    if let Some(name) = work_dir.file_name().and_then(|n| n.to_str()) {
        config = config.with_project(name);
    }
    config
        .write(work_dir)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Initialized taskflow in {}", work_dir.display());
    println!();
    println!("Created:");
    println!("  {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Point `backend.base_url` and `backend.model` at a chat completions endpoint");
    println!("  2. Run 'taskflow run \"<goal>\"'");

    Ok(())
}

async fn run_goal(work_dir: &Path, goal: &str, project: Option<String>, mode: Option<&str>) -> Result<()> {
    let config = EngineConfig::read(work_dir).await.with_env_overrides();

    let mut job_config = JobConfig::default();
    if let Some(project) = project {
        job_config = job_config.with_project(project);
    }
    if let Some(raw) = mode {
        let Some(mode) = RunMode::parse(raw) else {
            bail!("Unknown mode '{}', expected 'standard' or 'trace'", raw);
        };
        job_config = job_config.with_mode(mode);
    }

    let backend: Arc<dyn ReasoningBackend> = Arc::new(
        HttpBackend::from_config(&config.backend).context("Failed to create reasoning backend")?,
    );
    let amendments = Arc::new(AmendmentBus::new());
    let runner = PlanRunner::new(
        backend.clone(),
        Arc::new(LlmWorker::registry(backend.clone())),
        amendments.clone(),
        &config,
    );
    let activity = events::ActivityBus::with_capacity(config.activity_capacity);
    let scheduler = Arc::new(
        Scheduler::new(work_dir, config.clone(), Arc::new(runner), amendments, activity.clone())
            .with_summarizer(TraceSummarizer::new(backend, config.post_run_summary.clone())),
    );

    tracing::info!(work_dir = %work_dir.display(), model = %config.backend.model, "Starting run");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let feed = activity.history_plus_stream();
    let printer = tokio::spawn(async move {
        futures::pin_mut!(feed);
        while let Some(event) = feed.next().await {
            print_progress(&event);
        }
    });

    let job = scheduler.enqueue(goal, job_config)?;

    let stopper = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            println!("Stopping after the current step...");
            stopper.request_stop();
        }
    });

    let status = loop {
        match scheduler.status(job.uid) {
            Some(status) if status.is_terminal() => break status,
            Some(_) => tokio::time::sleep(STATUS_POLL).await,
            None => bail!("Job {} disappeared from the queue", job.uid),
        }
    };

    let result = scheduler
        .result(job.uid)
        .context("Finished job has no result")?;

    if scheduler.background().running() > 0 {
        println!("Summarizing trace...");
        let waited = tokio::time::timeout(SUMMARY_WAIT, async {
            while scheduler.background().running() > 0 {
                tokio::time::sleep(STATUS_POLL).await;
            }
        })
        .await;
        if waited.is_err() {
            tracing::warn!("Trace summary still running, not waiting any longer");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;
    printer.abort();

    println!();
    println!("Result [{}]", status);
    println!("════════════════════════════════════════");
    println!("{}", result.answer);
    println!();
    println!("  Reasoning:  {}", result.reasoning);
    if let Some(run_id) = &result.run_id {
        println!("  Run:        {}", run_id);
    }
    if let Some(dir) = &result.output_dir {
        println!("  Output:     {}", dir.display());
    }
    if let Some(trace) = &result.trace_file {
        println!("  Trace:      {}", trace.display());
    }
    println!();

    if status == JobStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_progress(event: &ActivityEvent) {
    match event.event.as_str() {
        "plan_created" | "plan_updated" => {
            let steps = event
                .fields
                .get("steps")
                .and_then(|s| s.as_array())
                .map(Vec::len)
                .unwrap_or(0);
            println!("  ◆ {} ({} steps)", event.event.replace('_', " "), steps);
        }
        "plan_step" => {
            let status = event.field_str("status").unwrap_or("?");
            let step = event.fields.get("step");
            let id = step
                .and_then(|s| s.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let task = step
                .and_then(|s| s.get("task"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let first_line = task.lines().next().unwrap_or_default();
            println!("  {} [{}] step {}: {}", step_icon(status), status, id, first_line);
        }
        "plan_step_forced_advance" | "plan_step_timeout_forced_advance" | "plan_step_time_budget_forced_advance" => {
            println!("  ⚠ {}", event.event.replace('_', " "));
        }
        "worker_disabled" => {
            println!("  ⚠ worker {} is disabled", event.field_str("worker").unwrap_or("?"));
        }
        "print" => {
            if let Some(text) = event.field_str("text") {
                println!();
                println!("{}", text);
            }
        }
        _ => {}
    }
}

fn step_icon(status: &str) -> &'static str {
    match StepStatus::parse(status) {
        Some(StepStatus::Pending) => "○",
        Some(StepStatus::Running) => "◐",
        Some(StepStatus::Completed) => "●",
        Some(StepStatus::Failed) => "✗",
        None => "?",
    }
}

async fn replay(trace_file: &Path) -> Result<()> {
    let events = orchestrator::trace::read_events(trace_file, usize::MAX)
        .await
        .with_context(|| format!("Failed to read {}", trace_file.display()))?;
    if events.is_empty() {
        println!("No events in {}", trace_file.display());
        return Ok(());
    }
    let replay = RunReplay::from_events(&events);

    println!();
    println!("Run:   {}", replay.run_id.as_deref().unwrap_or("unknown"));
    if let Some(query) = &replay.query {
        println!("Goal:  {}", query);
    }
    println!("Plans: {} version(s)", replay.plans.len());
    println!();

    if let Some(plan) = replay.final_plan() {
        println!("Final plan:");
        let outcomes = replay.step_outcomes();
        for step in plan {
            let status = outcomes
                .iter()
                .find(|(id, _)| *id == step.id)
                .map(|(_, s)| *s)
                .unwrap_or(StepStatus::Pending);
            let verdicts = replay.verdicts.iter().filter(|(id, _)| *id == step.id).count();
            println!(
                "  {} [{}] {} ({}) verdicts={} {}",
                step_icon(status.as_str()),
                status.as_str(),
                step.id,
                step.worker,
                verdicts,
                step.task.lines().next().unwrap_or_default()
            );
        }
        println!();
    }

    for advance in &replay.forced_advances {
        println!("  forced advance on step {}: {:?}", advance.step_id, advance.kind);
    }
    if replay.amendments_incorporated > 0 {
        println!("  amendments incorporated: {}", replay.amendments_incorporated);
    }
    for worker in &replay.disabled_workers {
        println!("  disabled worker requested: {}", worker);
    }
    if replay.stopped {
        println!("  run was stopped by request");
    }
    if let Some(failure) = &replay.failure {
        println!("  job failed: {}", failure);
    }

    if let Some(answer) = &replay.final_answer {
        println!();
        println!("Final answer:");
        println!("{}", answer);
    }
    if let Some(summary) = &replay.summary {
        println!();
        println!("Summary:");
        println!("{}", summary);
    }
    println!();

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskflow=info,orchestrator=info".into()),
        )
        .init();
}
