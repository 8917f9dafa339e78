use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use shared_logging::LogLevel;
use thiserror::Error;

/// Errors raised while loading `sweep.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config {path}: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("parsing config {path}: {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value parsed but is unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete sweep configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Locations of the three state surfaces and the derived files.
    pub paths: PathSettings,
    /// Input artifact naming and batch toggles.
    pub inputs: InputSettings,
    /// Simulator invocation and run record layout.
    pub simulator: SimulatorSettings,
    /// Structured log settings.
    pub logging: LoggingSettings,
}

impl SweepConfig {
    /// Loads configuration from a TOML file, resolving relative paths against
    /// the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_toml_str(&raw, &base).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses configuration text; relative paths are joined onto `base_dir`,
    /// itself made absolute against the current directory.
    pub fn from_toml_str(raw: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        let base_dir = &std::path::absolute(base_dir).map_err(|source| ConfigError::Io {
            path: base_dir.to_path_buf(),
            source,
        })?;
        config.paths.resolve_against(base_dir);
        let program = &config.simulator.program;
        if program.is_relative() && program.components().count() > 1 {
            let resolved = base_dir.join(program);
            config.simulator.program = resolved;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.inputs.prefix.is_empty() || self.inputs.prefix.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "inputs.prefix {:?} must be a plain, non-empty file name prefix",
                self.inputs.prefix
            )));
        }
        if self.inputs.extension.contains(['/', '\\', '.']) {
            return Err(ConfigError::Invalid(format!(
                "inputs.extension {:?} must not contain separators or dots",
                self.inputs.extension
            )));
        }
        if self.simulator.threads == 0 {
            return Err(ConfigError::Invalid("simulator.threads must be >= 1".into()));
        }
        if LogLevel::from_name(&self.logging.level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown logging.level {:?}",
                self.logging.level
            )));
        }
        for toggle in &self.inputs.toggles {
            if toggle.placeholder.trim().is_empty() {
                return Err(ConfigError::Invalid("toggle placeholder is empty".into()));
            }
        }
        Ok(())
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Specification table (CSV).
    pub table: PathBuf,
    /// Inlist template.
    pub template: PathBuf,
    /// Directory holding generated input artifacts.
    pub inputs_dir: PathBuf,
    /// Directory holding one run record directory per job.
    pub runs_dir: PathBuf,
    /// Append-only timing log (CSV).
    pub timing_log: PathBuf,
    /// Aggregated summary table (CSV).
    pub summary: PathBuf,
    /// Structured JSON-lines log.
    pub log: PathBuf,
}

impl PathSettings {
    fn resolve_against(&mut self, base: &Path) {
        for path in [
            &mut self.table,
            &mut self.template,
            &mut self.inputs_dir,
            &mut self.runs_dir,
            &mut self.timing_log,
            &mut self.summary,
            &mut self.log,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            table: PathBuf::from("params.csv"),
            template: PathBuf::from("inlist_template"),
            inputs_dir: PathBuf::from("inlists"),
            runs_dir: PathBuf::from("runs"),
            timing_log: PathBuf::from("timing.csv"),
            summary: PathBuf::from("summary.csv"),
            log: PathBuf::from("logs/sweep.log.jsonl"),
        }
    }
}

/// Input artifact settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    /// File name prefix, artifacts are `<prefix>_<job id>.<extension>`.
    pub prefix: String,
    /// File extension without the dot.
    pub extension: String,
    /// Optional modules confirmed once per generation batch.
    pub toggles: Vec<ToggleSettings>,
}

impl InputSettings {
    /// File name of the artifact for `job_id`.
    #[must_use]
    pub fn artifact_name(&self, job_id: &str) -> String {
        if self.extension.is_empty() {
            format!("{}_{job_id}", self.prefix)
        } else {
            format!("{}_{job_id}.{}", self.prefix, self.extension)
        }
    }

    /// Recovers the job id from an artifact file name, if it follows the
    /// naming scheme.
    #[must_use]
    pub fn job_id_from_name<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        let rest = file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('_')?;
        let id = if self.extension.is_empty() {
            rest
        } else {
            rest.strip_suffix(self.extension.as_str())?.strip_suffix('.')?
        };
        (!id.is_empty()).then_some(id)
    }
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            prefix: "inlist".into(),
            extension: "in".into(),
            toggles: Vec::new(),
        }
    }
}

/// A yes/no module switch resolved once per batch.
#[derive(Debug, Clone, Deserialize)]
pub struct ToggleSettings {
    /// Placeholder name the answer is rendered into.
    pub placeholder: String,
    /// Question shown to the operator.
    pub prompt: String,
    /// Answer used when the operator cannot be asked.
    #[serde(default)]
    pub default: bool,
}

/// Simulator invocation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    /// Executable. Bare names are looked up on `PATH`; relative paths are
    /// resolved against the config directory.
    pub program: PathBuf,
    /// Extra arguments.
    pub args: Vec<String>,
    /// Concurrency setting passed as `OMP_NUM_THREADS` and recorded in timing.
    pub threads: usize,
    /// Per-job wall-clock limit; none when absent.
    pub timeout_secs: Option<u64>,
    /// Log text that marks a normal termination; presence of the log is
    /// enough when absent.
    pub normal_termination: Option<String>,
    /// File layout inside each run directory.
    pub layout: RunLayout,
}

impl SimulatorSettings {
    /// Per-job timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("./star"),
            args: Vec::new(),
            threads: 1,
            timeout_secs: None,
            normal_termination: None,
            layout: RunLayout::default(),
        }
    }
}

/// Relative file names inside a run directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunLayout {
    /// Copy of the input artifact the simulator reads.
    pub input: PathBuf,
    /// Captured stdout and stderr.
    pub log: PathBuf,
    /// Time-series output.
    pub history: PathBuf,
    /// Final-state output.
    pub profile: PathBuf,
    /// Completion marker written by the runner.
    pub marker: PathBuf,
}

impl Default for RunLayout {
    fn default() -> Self {
        Self {
            input: PathBuf::from("inlist"),
            log: PathBuf::from("run.log"),
            history: PathBuf::from("LOGS/history.data"),
            profile: PathBuf::from("LOGS/final_profile.data"),
            marker: PathBuf::from("run_status.json"),
        }
    }
}

/// Structured log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Minimum level name (`debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Mirror warnings and errors to stderr.
    pub stderr: bool,
}

impl LoggingSettings {
    /// Parsed minimum level; validated at load time.
    #[must_use]
    pub fn min_level(&self) -> LogLevel {
        LogLevel::from_name(&self.level).unwrap_or_default()
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            stderr: true,
        }
    }
}
