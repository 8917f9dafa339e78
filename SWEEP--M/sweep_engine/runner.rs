use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    confirm::ConfirmationPolicy,
    error::SweepError,
    naming::JobId,
    simulator::{ExecutionRequest, ExitState, SimulatorBackend},
    store::{CompletionMarker, MarkerStatus, RunFile, SweepStore, TimingRecord},
    table::ParameterRow,
    telemetry::{emit, SweepTelemetry},
};

/// Runner knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Concurrency setting passed to every job.
    pub threads: usize,
    /// Re-run jobs whose marker records a failure.
    pub rerun_failed: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            rerun_failed: false,
        }
    }
}

/// What the runner did with one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Simulator exited successfully.
    Completed {
        /// Wall-clock duration.
        wall_clock_seconds: f64,
    },
    /// Simulator ran and failed.
    Failed {
        /// How it ended.
        exit: ExitState,
        /// Wall-clock duration.
        wall_clock_seconds: f64,
    },
    /// A terminal marker already existed.
    Skipped {
        /// Status of the existing marker.
        previous: MarkerStatus,
    },
    /// No input artifact exists for the row.
    MissingInput,
}

/// Outcome of one queue pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// The operator declined the batch; nothing ran.
    pub declined: bool,
    /// Per-row outcome in table order. Rows after an environment fault are
    /// absent.
    pub jobs: IndexMap<JobId, JobOutcome>,
}

impl RunSummary {
    /// Jobs the simulator was invoked for.
    #[must_use]
    pub fn executed(&self) -> usize {
        self.completed() + self.failed()
    }

    /// Jobs that completed in this pass.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Completed { .. }))
    }

    /// Jobs that failed in this pass.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Failed { .. }))
    }

    /// Jobs skipped because a marker existed.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Skipped { .. }))
    }

    /// Rows without an input artifact.
    #[must_use]
    pub fn missing_input(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::MissingInput))
    }

    fn count(&self, predicate: impl Fn(&JobOutcome) -> bool) -> usize {
        self.jobs.values().filter(|o| predicate(o)).count()
    }
}

enum Plan {
    Run(String),
    Skip(MarkerStatus),
    MissingInput,
}

/// Executes one simulator job per row, sequentially and resumably.
pub struct JobRunner {
    store: Arc<dyn SweepStore>,
    backend: Arc<dyn SimulatorBackend>,
    options: RunnerOptions,
    telemetry: Option<SweepTelemetry>,
}

impl JobRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        store: Arc<dyn SweepStore>,
        backend: Arc<dyn SimulatorBackend>,
        options: RunnerOptions,
        telemetry: Option<SweepTelemetry>,
    ) -> Self {
        Self {
            store,
            backend,
            options,
            telemetry,
        }
    }

    /// Runs every pending row. A failing job is recorded and the queue
    /// continues; an environment fault aborts it with
    /// [`SweepError::EnvironmentFault`].
    pub async fn run(
        &self,
        rows: &[ParameterRow],
        confirm: &dyn ConfirmationPolicy,
    ) -> Result<RunSummary> {
        let plans = self.plan(rows)?;
        let pending = plans.iter().filter(|(_, plan)| matches!(plan, Plan::Run(_))).count();
        let mut summary = RunSummary::default();

        if pending > 0 {
            let prompt = format!(
                "Run {pending} of {} simulation jobs with {} thread(s) each?",
                rows.len(),
                self.options.threads
            );
            if !confirm.confirm(&prompt, false)? {
                emit(
                    self.telemetry.as_ref(),
                    LogLevel::Warn,
                    "runner.batch.declined",
                    None,
                    json!({ "pending": pending }),
                );
                summary.declined = true;
                return Ok(summary);
            }
        }

        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "runner.batch.start",
            None,
            json!({ "rows": rows.len(), "pending": pending, "threads": self.options.threads }),
        );
        for (job_id, plan) in plans {
            let outcome = match plan {
                Plan::MissingInput => {
                    emit(
                        self.telemetry.as_ref(),
                        LogLevel::Warn,
                        "runner.job.missing_input",
                        Some(job_id.as_str()),
                        json!({}),
                    );
                    JobOutcome::MissingInput
                }
                Plan::Skip(previous) => {
                    emit(
                        self.telemetry.as_ref(),
                        LogLevel::Debug,
                        "runner.job.skipped",
                        Some(job_id.as_str()),
                        json!({ "previous": previous }),
                    );
                    JobOutcome::Skipped { previous }
                }
                Plan::Run(input) => self.run_job(&job_id, &input).await?,
            };
            summary.jobs.insert(job_id, outcome);
        }
        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "runner.batch.completed",
            None,
            json!({
                "completed": summary.completed(),
                "failed": summary.failed(),
                "skipped": summary.skipped(),
                "missing_input": summary.missing_input(),
            }),
        );
        Ok(summary)
    }

    fn plan(&self, rows: &[ParameterRow]) -> Result<Vec<(JobId, Plan)>> {
        let mut plans = Vec::with_capacity(rows.len());
        for row in rows {
            let job_id = row.job_id();
            let plan = match self.store.read_artifact(&job_id).map_err(SweepError::from)? {
                None => Plan::MissingInput,
                Some(input) => match self.previous_status(&job_id)? {
                    Some(MarkerStatus::Completed) => Plan::Skip(MarkerStatus::Completed),
                    Some(MarkerStatus::Failed) if !self.options.rerun_failed => {
                        Plan::Skip(MarkerStatus::Failed)
                    }
                    _ => Plan::Run(input),
                },
            };
            plans.push((job_id, plan));
        }
        Ok(plans)
    }

    /// Status of an existing marker; an unreadable marker counts as failed.
    fn previous_status(&self, job_id: &JobId) -> Result<Option<MarkerStatus>> {
        let raw = self
            .store
            .read_run_file(job_id, RunFile::Marker)
            .map_err(SweepError::from)?;
        Ok(raw.map(|raw| {
            CompletionMarker::from_json(&raw).map_or(MarkerStatus::Failed, |marker| marker.status)
        }))
    }

    async fn run_job(&self, job_id: &JobId, input: &str) -> Result<JobOutcome> {
        let workdir = self
            .store
            .prepare_run(job_id, input)
            .map_err(SweepError::from)?;
        let request = ExecutionRequest {
            job_id: job_id.clone(),
            workdir,
            log_path: self.store.run_path(job_id, RunFile::Log),
            threads: self.options.threads,
        };
        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "runner.job.start",
            Some(job_id.as_str()),
            json!({ "workdir": request.workdir, "threads": request.threads }),
        );

        let outcome = match self.backend.execute(&request).await {
            Ok(outcome) => outcome,
            Err(fault) => {
                emit(
                    self.telemetry.as_ref(),
                    LogLevel::Error,
                    "runner.environment_fault",
                    Some(job_id.as_str()),
                    json!({ "reason": fault.to_string() }),
                );
                return Err(SweepError::EnvironmentFault {
                    job_id: job_id.clone(),
                    source: fault,
                }
                .into());
            }
        };

        let wall_clock_seconds = outcome.duration.as_secs_f64();
        let status = if outcome.exit.is_success() {
            MarkerStatus::Completed
        } else {
            MarkerStatus::Failed
        };
        let marker = CompletionMarker {
            job_id: job_id.clone(),
            status,
            exit_code: match outcome.exit {
                ExitState::Success => Some(0),
                ExitState::Code(code) => Some(code),
                ExitState::Signal(_) | ExitState::TimedOut => None,
            },
            signal: match outcome.exit {
                ExitState::Signal(signal) => Some(signal),
                _ => None,
            },
            timed_out: outcome.exit == ExitState::TimedOut,
            wall_clock_seconds,
            threads: self.options.threads,
            finished_at: Utc::now(),
        };
        self.store
            .write_run_file(job_id, RunFile::Marker, &marker.to_json()?)
            .map_err(SweepError::from)?;
        self.store
            .append_timing(&TimingRecord {
                job_id: job_id.clone(),
                wall_clock_seconds,
                threads: self.options.threads,
            })
            .map_err(SweepError::from)?;

        if status == MarkerStatus::Completed {
            emit(
                self.telemetry.as_ref(),
                LogLevel::Info,
                "runner.job.completed",
                Some(job_id.as_str()),
                json!({ "wall_clock_seconds": wall_clock_seconds }),
            );
            Ok(JobOutcome::Completed { wall_clock_seconds })
        } else {
            emit(
                self.telemetry.as_ref(),
                LogLevel::Error,
                "runner.job.failed",
                Some(job_id.as_str()),
                json!({ "exit": outcome.exit, "wall_clock_seconds": wall_clock_seconds }),
            );
            Ok(JobOutcome::Failed {
                exit: outcome.exit,
                wall_clock_seconds,
            })
        }
    }
}
