//! External Process Jobs
//!
//! Runs an encoder binary (typically FFmpeg) as a job. Progress is read from
//! FFmpeg's `-progress pipe:1` key/value stream on stdout, and the tail of
//! stderr is kept for failure reports.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{JobType, Priority, Task, TaskContext, TaskError};

/// Number of stderr lines kept for failure reports
const LOG_TAIL_LINES: usize = 20;

/// How long to wait for the stderr reader after the process exits
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Waits briefly for a pipe reader, aborting it if the pipe stays open
async fn drain_reader<T>(mut reader: JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut reader).await {
        Ok(result) => result.ok(),
        Err(_) => {
            reader.abort();
            None
        }
    }
}

/// Keeps console binaries from flashing a window on Windows
fn configure_command(cmd: &mut Command) {
    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Default)]
struct ReportState {
    error_message: Option<String>,
    log_details: Vec<String>,
    exit_code: Option<i32>,
    was_cancelled: bool,
}

/// Outcome of a [`TranscodeTask`], shared with the caller that created it.
///
/// The scheduler never reads it; the job writes it before returning.
#[derive(Clone, Debug, Default)]
pub struct TranscodeReport {
    state: Arc<Mutex<ReportState>>,
}

impl TranscodeReport {
    fn lock(&self) -> MutexGuard<'_, ReportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Human-readable failure description, if the job failed
    pub fn error_message(&self) -> Option<String> {
        self.lock().error_message.clone()
    }

    /// Last lines of the process's stderr
    pub fn log_details(&self) -> String {
        self.lock().log_details.join("\n")
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn was_cancelled(&self) -> bool {
        self.lock().was_cancelled
    }

    /// True when the process ran to a zero exit
    pub fn succeeded(&self) -> bool {
        let state = self.lock();
        state.exit_code == Some(0) && state.error_message.is_none() && !state.was_cancelled
    }

    fn record_failure(&self, message: String, log_details: Vec<String>) {
        let mut state = self.lock();
        state.error_message = Some(message);
        state.log_details = log_details;
    }
}

// =============================================================================
// Progress Parsing
// =============================================================================

/// Incremental parser for FFmpeg `-progress` output
#[derive(Debug)]
struct ProgressParser {
    duration_secs: Option<f64>,
    out_time_secs: f64,
}

impl ProgressParser {
    fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            out_time_secs: 0.0,
        }
    }

    /// Feeds one line; returns a percentage at the end of each progress block
    fn feed(&mut self, line: &str) -> Option<u8> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key {
            // Both keys carry microseconds
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<u64>() {
                    self.out_time_secs = us as f64 / 1_000_000.0;
                }
                None
            }
            "out_time" => {
                if let Some(secs) = parse_timestamp(value) {
                    self.out_time_secs = secs;
                }
                None
            }
            "progress" if value == "end" => Some(100),
            "progress" => {
                let duration = self.duration_secs?;
                // 100 is reserved for a finished process
                let percent = (self.out_time_secs / duration * 100.0).clamp(0.0, 99.0);
                Some(percent as u8)
            }
            _ => None,
        }
    }
}

/// Parses `HH:MM:SS.ffffff` into seconds
fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

// =============================================================================
// Transcode Task
// =============================================================================

/// A job that runs one external process to completion
#[derive(Debug)]
pub struct TranscodeTask {
    job_type: JobType,
    priority: Priority,
    program: PathBuf,
    args: Vec<OsString>,
    duration_secs: Option<f64>,
    description: Option<String>,
    report: TranscodeReport,
}

impl TranscodeTask {
    pub fn new(job_type: JobType, program: impl Into<PathBuf>) -> Self {
        Self {
            job_type,
            priority: Priority::Normal,
            program: program.into(),
            args: Vec::new(),
            duration_secs: None,
            description: None,
            report: TranscodeReport::default(),
        }
    }

    /// Proxy generation preset (720p, ultrafast x264, AAC)
    pub fn ffmpeg_proxy(
        ffmpeg: impl Into<PathBuf>,
        input: &Path,
        output: &Path,
        duration_secs: Option<f64>,
    ) -> Self {
        let mut args: Vec<OsString> = vec!["-hide_banner".into(), "-nostats".into(), "-i".into()];
        args.push(input.as_os_str().to_os_string());
        args.extend(
            [
                "-vf",
                "scale=1280:720",
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-crf",
                "28",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-progress",
                "pipe:1",
                "-y",
            ]
            .map(OsString::from),
        );
        args.push(output.as_os_str().to_os_string());

        let mut task = Self::new(JobType::Proxy, ffmpeg)
            .args(args)
            .with_description(format!("proxy for {}", input.display()));
        task.duration_secs = duration_secs;
        task
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Media duration used to turn output timestamps into percentages
    pub fn duration_hint(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Shared outcome record; clone it before handing the task to the scheduler
    pub fn report(&self) -> TranscodeReport {
        self.report.clone()
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl Task for TranscodeTask {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("{} ({})", self.job_type, self.program_name()))
    }

    async fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        ctx.check_cancelled()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_command(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to start {}: {}", self.program_name(), e);
                self.report.record_failure(message, Vec::new());
                return Err(TaskError::Process(e));
            }
        };
        tracing::debug!(
            "Job {} spawned {} (pid {:?})",
            ctx.job_id(),
            self.program.display(),
            child.id()
        );

        let progress_reader = child.stdout.take().map(|stdout| {
            let ctx = ctx.clone();
            let mut parser = ProgressParser::new(self.duration_secs);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(percent) = parser.feed(&line) {
                        ctx.set_progress(percent);
                    }
                }
            })
        });

        let log_reader = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(LOG_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == LOG_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail)
            })
        });

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(
                        "Failed to kill {} for job {}: {}",
                        self.program_name(),
                        ctx.job_id(),
                        e
                    );
                }
                None
            }
        };

        if let Some(reader) = progress_reader {
            if status.is_some() {
                // Pick up the final progress block before reporting
                drain_reader(reader).await;
            } else {
                reader.abort();
            }
        }
        let log_details = match log_reader {
            Some(reader) => drain_reader(reader).await.unwrap_or_default(),
            None => Vec::new(),
        };

        let status = match status {
            Some(status) => status?,
            None => {
                let mut state = self.report.lock();
                state.was_cancelled = true;
                state.log_details = log_details;
                return Err(TaskError::Cancelled);
            }
        };

        self.report.lock().exit_code = status.code();
        if status.success() {
            ctx.set_progress(100);
            Ok(())
        } else {
            let message = format!("{} exited with {}", self.program_name(), status);
            self.report.record_failure(message.clone(), log_details);
            Err(TaskError::Failed(message))
        }
    }
}
