//! ReelQueue CLI
//!
//! Runs simulated or external-process jobs through the scheduler from a shell.

use std::future::pending;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use reelqueue::{
    FnTask, JobFilter, JobType, ObjectId, ObjectType, SchedulerSettings, SettingsManager,
    TaskError, TaskManager, TranscodeTask,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "reelqueue-cli")]
#[command(version, about = "Drive the ReelQueue background job scheduler", long_about = None)]
struct Cli {
    /// Scheduler settings file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the general pool size
    #[arg(long, global = true)]
    general_workers: Option<usize>,

    /// Override the constrained pool size
    #[arg(long, global = true)]
    constrained_workers: Option<usize>,

    /// Also write daily rolling log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run simulated jobs and print status until the queue is idle
    Simulate {
        /// Number of owners (bin clips) to start jobs for
        #[arg(long, default_value_t = 3)]
        owners: i64,

        /// Jobs started per owner
        #[arg(long, default_value_t = 2)]
        jobs_per_owner: usize,

        /// Job type of the simulated jobs
        #[arg(long, value_enum, default_value = "analysis")]
        kind: KindArg,

        /// Duration of each of the ten progress steps
        #[arg(long, default_value_t = 50)]
        step_ms: u64,

        /// Discard every job after this many milliseconds
        #[arg(long)]
        cancel_after_ms: Option<u64>,
    },

    /// Run one external process as a job (Ctrl-C cancels it)
    Exec {
        /// Job type, which selects the pool
        #[arg(long, value_enum, default_value = "transcode")]
        kind: KindArg,

        /// Media duration in seconds, for progress from `-progress pipe:1`
        #[arg(long)]
        duration: Option<f64>,

        /// Program and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the effective settings as JSON
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Generic,
    Proxy,
    Transcode,
    Analysis,
}

impl From<KindArg> for JobType {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Generic => JobType::Generic,
            KindArg::Proxy => JobType::Proxy,
            KindArg::Transcode => JobType::Transcode,
            KindArg::Analysis => JobType::Analysis,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = load_settings(&cli)?;
    reelqueue::init_logging_with_level(cli.log_dir.as_deref(), &settings.log_level);

    match cli.command {
        Command::Simulate {
            owners,
            jobs_per_owner,
            kind,
            step_ms,
            cancel_after_ms,
        } => {
            simulate(
                &settings,
                owners,
                jobs_per_owner,
                kind.into(),
                Duration::from_millis(step_ms),
                cancel_after_ms.map(Duration::from_millis),
            )
            .await
        }
        Command::Exec {
            kind,
            duration,
            command,
        } => exec(&settings, kind.into(), duration, command).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn load_settings(cli: &Cli) -> anyhow::Result<SchedulerSettings> {
    let mut settings = match &cli.config {
        Some(path) => SettingsManager::with_file(path)
            .load()
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => SchedulerSettings::default(),
    };

    if let Some(workers) = cli.general_workers {
        settings.pool.general_workers = workers;
    }
    if let Some(workers) = cli.constrained_workers {
        settings.pool.constrained_workers = workers;
    }
    settings.normalize();
    Ok(settings)
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Ten-step job that reports 10% per step
fn simulated_job(job_type: JobType, step: Duration, label: String) -> FnTask {
    FnTask::new(job_type, move |ctx| async move {
        for i in 1..=10u8 {
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = ctx.cancelled() => return Err(TaskError::Cancelled),
            }
            ctx.set_progress(i * 10);
        }
        Ok(())
    })
    .with_description(label)
}

async fn simulate(
    settings: &SchedulerSettings,
    owner_count: i64,
    jobs_per_owner: usize,
    job_type: JobType,
    step: Duration,
    cancel_after: Option<Duration>,
) -> anyhow::Result<()> {
    let tm = TaskManager::new(settings.pool.clone());
    let owners: Vec<ObjectId> = (1..=owner_count).map(ObjectId::bin_clip).collect();
    let mut counts = tm.subscribe_job_count();
    let started = Instant::now();

    for owner in &owners {
        for n in 0..jobs_per_owner {
            let label = format!("{job_type} #{n} for {owner}");
            let job_id = tm.start_task(*owner, simulated_job(job_type, step, label));
            info!("Started simulated job {} for {}", job_id, owner);
        }
    }
    println!(
        "[{}] started {} {} job(s) on the {:?} pool",
        timestamp(),
        owners.len() * jobs_per_owner,
        job_type,
        settings.pool.pool_for(job_type)
    );

    let cancel_timer = async {
        match cancel_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => pending::<()>().await,
        }
    };
    tokio::pin!(cancel_timer);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(step.max(Duration::from_millis(10)) * 2);
    let mut discarded = false;

    while tm.job_count() > 0 {
        tokio::select! {
            _ = ticker.tick() => {
                for owner in &owners {
                    println!(
                        "[{}]   {}: {:?} {}%",
                        timestamp(),
                        owner,
                        tm.job_status(*owner),
                        tm.job_progress(*owner)
                    );
                }
            }
            changed = counts.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *counts.borrow_and_update();
                println!("[{}] outstanding jobs: {}", timestamp(), count.outstanding);
            }
            _ = &mut cancel_timer, if !discarded => {
                discarded = true;
                println!("[{}] discarding all jobs", timestamp());
                info!("Discarding jobs for {} owner(s)", owners.len());
                for owner in &owners {
                    tm.discard_jobs(*owner, JobFilter::Any).await;
                }
            }
            _ = &mut ctrl_c, if !discarded => {
                discarded = true;
                println!("[{}] interrupted; cancelling", timestamp());
                warn!("Interrupted, cancelling all jobs");
                tm.cancel_all_jobs().await;
            }
        }
    }

    tm.shutdown().await;
    println!(
        "[{}] idle after {:.2}s{}",
        timestamp(),
        started.elapsed().as_secs_f64(),
        if discarded { " (cancelled)" } else { "" }
    );
    Ok(())
}

async fn exec(
    settings: &SchedulerSettings,
    job_type: JobType,
    duration: Option<f64>,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("no program given");
    };

    let mut task = TranscodeTask::new(job_type, program).args(args);
    if let Some(secs) = duration {
        task = task.duration_hint(secs);
    }
    let report = task.report();

    let tm = TaskManager::new(settings.pool.clone());
    let owner = ObjectId::new(ObjectType::Project, 0);
    let mut counts = tm.subscribe_job_count();
    let job_id = tm.start_task(owner, task);
    println!("[{}] started job {} ({})", timestamp(), job_id, program);
    info!("Started {} job {} running {}", job_type, job_id, program);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut interrupted = false;

    while tm.has_pending_job(owner, JobFilter::Any) {
        tokio::select! {
            _ = ticker.tick() => {
                let status = tm.job_status(owner);
                println!("[{}] {:?} {}%", timestamp(), status, tm.job_progress(owner));
            }
            _ = counts.changed() => {}
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                println!("[{}] interrupted; cancelling", timestamp());
                warn!("Interrupted, cancelling job {}", job_id);
                tm.discard_jobs(owner, JobFilter::Any).await;
            }
        }
    }
    tm.shutdown().await;

    if report.succeeded() {
        println!("[{}] {} finished", timestamp(), program);
        Ok(())
    } else if report.was_cancelled() {
        bail!("{program} was cancelled");
    } else {
        let message = report
            .error_message()
            .unwrap_or_else(|| format!("{program} failed"));
        let details = report.log_details();
        if details.is_empty() {
            bail!("{message}");
        }
        bail!("{message}\n{details}");
    }
}
