use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, time::timeout};

use crate::{config::SimulatorSettings, naming::JobId};

/// Faults in the runner's environment rather than in one job. They abort the
/// whole queue.
#[derive(Debug, Error)]
pub enum SimulatorFault {
    /// The simulator program could not be started.
    #[error("cannot start simulator {program}: {source}")]
    Spawn {
        /// Program path.
        program: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The log destination could not be opened.
    #[error("cannot open log {path}: {source}")]
    LogFile {
        /// Log path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Waiting on the child process failed.
    #[error("lost track of simulator process: {0}")]
    Wait(#[source] io::Error),
}

/// One simulator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Job being run.
    pub job_id: JobId,
    /// Working directory holding the input copy.
    pub workdir: PathBuf,
    /// Where stdout and stderr are captured.
    pub log_path: PathBuf,
    /// Concurrency passed to the simulator.
    pub threads: usize,
}

/// How the subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitState {
    /// Exit code zero.
    Success,
    /// Non-zero exit code.
    Code(i32),
    /// Killed by a signal.
    Signal(i32),
    /// Killed by the runner at its time limit.
    TimedOut,
}

impl ExitState {
    /// Whether the subprocess reported success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return Self::Success;
        }
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        signal_of(status).map_or(Self::Code(-1), Self::Signal)
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

/// Result of one invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionOutcome {
    /// Terminal state.
    pub exit: ExitState,
    /// Wall-clock time from spawn to exit.
    pub duration: Duration,
}

/// Runs the external simulator for one job.
#[async_trait]
pub trait SimulatorBackend: Send + Sync {
    /// Executes the request and waits for the subprocess to end. A job that
    /// runs and fails is an `Ok` outcome; only environment faults are `Err`.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, SimulatorFault>;
}

/// Spawns the configured program as a child process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessBackend {
    /// Builds the backend from `[simulator]` settings.
    #[must_use]
    pub fn from_settings(settings: &SimulatorSettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            timeout: settings.timeout(),
        }
    }

    /// Creates a backend for an explicit program.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn open_log(path: &Path) -> Result<(fs::File, fs::File), SimulatorFault> {
        let fault = |source: io::Error| SimulatorFault::LogFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(fault)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(fault)?;
        let stderr = stdout.try_clone().map_err(fault)?;
        Ok((stdout, stderr))
    }
}

#[async_trait]
impl SimulatorBackend for ProcessBackend {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, SimulatorFault> {
        let (stdout, stderr) = Self::open_log(&request.log_path)?;
        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.workdir)
            .env("OMP_NUM_THREADS", request.threads.max(1).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SimulatorFault::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let exit = match self.timeout {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(status) => ExitState::from_status(status.map_err(SimulatorFault::Wait)?),
                Err(_) => {
                    child.kill().await.map_err(SimulatorFault::Wait)?;
                    ExitState::TimedOut
                }
            },
            None => ExitState::from_status(child.wait().await.map_err(SimulatorFault::Wait)?),
        };
        Ok(ExecutionOutcome {
            exit,
            duration: started.elapsed(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(dir: &std::path::Path) -> ExecutionRequest {
        ExecutionRequest {
            job_id: JobId::from_stored("M1.0000"),
            workdir: dir.to_path_buf(),
            log_path: dir.join("logs/run.log"),
            threads: 3,
        }
    }

    fn shell(script: &str, limit: Option<Duration>) -> ProcessBackend {
        ProcessBackend::new("/bin/sh", vec!["-c".into(), script.into()], limit)
    }

    #[tokio::test]
    async fn captures_output_and_environment() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("inlist"), "x").unwrap();
        let backend = shell("echo threads=$OMP_NUM_THREADS; ls; echo oops >&2", None);
        let outcome = backend.execute(&request(tmp.path())).await.unwrap();
        assert_eq!(outcome.exit, ExitState::Success);
        let log = fs::read_to_string(tmp.path().join("logs/run.log")).unwrap();
        assert!(log.contains("threads=3"));
        assert!(log.contains("inlist"));
        assert!(log.contains("oops"));
    }

    #[tokio::test]
    async fn reports_exit_codes() {
        let tmp = tempdir().unwrap();
        let outcome = shell("exit 3", None).execute(&request(tmp.path())).await.unwrap();
        assert_eq!(outcome.exit, ExitState::Code(3));
        assert!(!outcome.exit.is_success());
    }

    #[tokio::test]
    async fn kills_jobs_past_their_limit() {
        let tmp = tempdir().unwrap();
        let backend = shell("sleep 5", Some(Duration::from_millis(100)));
        let outcome = backend.execute(&request(tmp.path())).await.unwrap();
        assert_eq!(outcome.exit, ExitState::TimedOut);
        assert!(outcome.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program_is_an_environment_fault() {
        let tmp = tempdir().unwrap();
        let backend = ProcessBackend::new(tmp.path().join("no-such-star"), Vec::new(), None);
        let err = backend.execute(&request(tmp.path())).await.unwrap_err();
        assert!(matches!(err, SimulatorFault::Spawn { .. }));
    }
}
