use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

/// Telemetry builder for the sweep engine.
pub struct SweepTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    mirror_stderr: bool,
}

impl SweepTelemetryBuilder {
    /// Creates a new builder scoped to a module label.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            mirror_stderr: false,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the minimum level written to the log.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Mirrors warnings and errors to stderr.
    #[must_use]
    pub const fn mirror_stderr(mut self, enabled: bool) -> Self {
        self.mirror_stderr = enabled;
        self
    }

    /// Builds telemetry.
    pub fn build(self) -> Result<SweepTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(
                JsonLogger::new(path)?
                    .with_min_level(self.min_level)
                    .with_stderr_mirror(self.mirror_stderr),
            ),
            None => None,
        };
        Ok(SweepTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                batch_id: format!("batch-{}", Uuid::new_v4()),
                logger,
            }),
        })
    }
}

/// Telemetry handle shared across pipeline stages.
#[derive(Clone)]
pub struct SweepTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for SweepTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepTelemetry")
            .field("module", &self.inner.module)
            .field("batch_id", &self.inner.batch_id)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    batch_id: String,
    logger: Option<JsonLogger>,
}

impl SweepTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> SweepTelemetryBuilder {
        SweepTelemetryBuilder::new(module)
    }

    /// Identifier shared by every record of this process.
    #[must_use]
    pub fn batch_id(&self) -> &str {
        &self.inner.batch_id
    }

    /// Logs an event with metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        self.write(level, message, None, &metadata)
    }

    /// Logs an event that concerns one job.
    pub fn job(&self, level: LogLevel, message: &str, job_id: &str, metadata: Value) -> Result<()> {
        self.write(level, message, Some(job_id), &metadata)
    }

    fn write(
        &self,
        level: LogLevel,
        message: &str,
        job_id: Option<&str>,
        metadata: &Value,
    ) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            record
                .metadata
                .insert("batch_id".into(), Value::String(self.inner.batch_id.clone()));
            if let Some(job_id) = job_id {
                record = record.with_job(job_id);
            }
            logger.log(&record)?;
        }
        Ok(())
    }
}

/// Logs through an optional telemetry handle, ignoring logger failures.
pub(crate) fn emit(
    telemetry: Option<&SweepTelemetry>,
    level: LogLevel,
    message: &str,
    job_id: Option<&str>,
    metadata: Value,
) {
    if let Some(tel) = telemetry {
        let _ = match job_id {
            Some(job_id) => tel.job(level, message, job_id, metadata),
            None => tel.log(level, message, metadata),
        };
    }
}
