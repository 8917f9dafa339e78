use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{InputSettings, RunLayout, SweepConfig},
    naming::JobId,
    table::{csv_escape, split_csv_record},
};

/// Header of the timing log.
pub const TIMING_HEADER: &str = "job_id,wall_clock_seconds,threads";

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error (filesystem).
    #[error("{path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// A stored file does not have the expected shape.
    #[error("{path}: {reason}")]
    Malformed {
        /// Path being read.
        path: PathBuf,
        /// Description.
        reason: String,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Files inside one run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RunFile {
    /// Copy of the input artifact used for the run.
    Input,
    /// Captured simulator output.
    Log,
    /// Time-series output.
    History,
    /// Final-state output.
    Profile,
    /// Completion marker.
    Marker,
}

impl fmt::Display for RunFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Log => "log",
            Self::History => "history",
            Self::Profile => "profile",
            Self::Marker => "marker",
        })
    }
}

/// Terminal state recorded by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    /// The simulator exited successfully.
    Completed,
    /// The simulator exited with an error, was signalled or timed out.
    Failed,
}

/// Completion marker written once a job's subprocess has ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    /// Identifier of the job.
    pub job_id: JobId,
    /// Terminal state.
    pub status: MarkerStatus,
    /// Exit code, when the process exited normally.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Terminating signal, when killed by one.
    #[serde(default)]
    pub signal: Option<i32>,
    /// Whether the runner killed the job at its time limit.
    #[serde(default)]
    pub timed_out: bool,
    /// Wall-clock duration.
    pub wall_clock_seconds: f64,
    /// Concurrency setting used.
    pub threads: usize,
    /// When the runner recorded the outcome.
    pub finished_at: DateTime<Utc>,
}

impl CompletionMarker {
    /// Parses the JSON marker text.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Pretty JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// One line of the timing log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    /// Identifier of the job.
    pub job_id: JobId,
    /// Wall-clock duration of the subprocess.
    pub wall_clock_seconds: f64,
    /// Concurrency setting.
    pub threads: usize,
}

impl TimingRecord {
    fn to_csv_line(&self) -> String {
        format!(
            "{},{},{}",
            csv_escape(self.job_id.as_str()),
            self.wall_clock_seconds,
            self.threads
        )
    }

    fn from_csv_line(line: &str) -> Option<Self> {
        let cells = split_csv_record(line).ok()?;
        let [job_id, seconds, threads] = cells.as_slice() else {
            return None;
        };
        Some(Self {
            job_id: JobId::from_stored(job_id.clone()),
            wall_clock_seconds: seconds.parse().ok()?,
            threads: threads.parse().ok()?,
        })
    }
}

fn ends_with_newline(file: &mut fs::File, len: u64) -> io::Result<bool> {
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn parse_timing_log(raw: &str) -> Vec<TimingRecord> {
    raw.lines()
        .filter(|line| !line.trim().is_empty() && line.trim() != TIMING_HEADER)
        .filter_map(TimingRecord::from_csv_line)
        .collect()
}

/// Storage of input artifacts, run records and the timing log, addressed by
/// job identifier.
pub trait SweepStore: Send + Sync {
    /// Identifiers of all stored input artifacts, sorted.
    fn list_artifacts(&self) -> Result<Vec<JobId>, StoreError>;
    /// Artifact text, `None` when absent.
    fn read_artifact(&self, job_id: &JobId) -> Result<Option<String>, StoreError>;
    /// Creates or replaces an artifact.
    fn write_artifact(&self, job_id: &JobId, contents: &str) -> Result<(), StoreError>;
    /// Identifiers of all run records, sorted.
    fn list_runs(&self) -> Result<Vec<JobId>, StoreError>;
    /// Creates (or reuses) the run record, drops a stale marker and stores
    /// the input copy. Returns the working directory.
    fn prepare_run(&self, job_id: &JobId, input: &str) -> Result<PathBuf, StoreError>;
    /// Location of a run file, for collaborators that need a real path.
    fn run_path(&self, job_id: &JobId, file: RunFile) -> PathBuf;
    /// Run file text, `None` when absent.
    fn read_run_file(&self, job_id: &JobId, file: RunFile) -> Result<Option<String>, StoreError>;
    /// Creates or replaces a run file.
    fn write_run_file(&self, job_id: &JobId, file: RunFile, contents: &str) -> Result<(), StoreError>;
    /// Appends one timing record.
    fn append_timing(&self, record: &TimingRecord) -> Result<(), StoreError>;
    /// All timing records in append order. Unparseable lines are skipped.
    fn read_timings(&self) -> Result<Vec<TimingRecord>, StoreError>;
}

/// Filesystem layout described by `sweep.toml`.
#[derive(Debug, Clone)]
pub struct FsStore {
    inputs_dir: PathBuf,
    runs_dir: PathBuf,
    timing_log: PathBuf,
    inputs: InputSettings,
    layout: RunLayout,
}

impl FsStore {
    /// Builds the store from configuration.
    #[must_use]
    pub fn from_config(config: &SweepConfig) -> Self {
        Self {
            inputs_dir: config.paths.inputs_dir.clone(),
            runs_dir: config.paths.runs_dir.clone(),
            timing_log: config.paths.timing_log.clone(),
            inputs: config.inputs.clone(),
            layout: config.simulator.layout.clone(),
        }
    }

    /// Path of the artifact for `job_id`.
    #[must_use]
    pub fn artifact_path(&self, job_id: &JobId) -> PathBuf {
        self.inputs_dir.join(self.inputs.artifact_name(job_id.as_str()))
    }

    fn run_dir(&self, job_id: &JobId) -> PathBuf {
        self.runs_dir.join(job_id.as_str())
    }

    fn layout_path(&self, file: RunFile) -> &Path {
        match file {
            RunFile::Input => &self.layout.input,
            RunFile::Log => &self.layout.log,
            RunFile::History => &self.layout.history,
            RunFile::Profile => &self.layout.profile,
            RunFile::Marker => &self.layout.marker,
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path)(err)),
    }
}

/// Writes through a sibling temporary file so readers never see a partial
/// file.
fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, contents).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

fn list_entries(dir: &Path, want_dirs: bool) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(dir)(err)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        let file_type = entry.file_type().map_err(io_err(&entry.path()))?;
        if file_type.is_dir() != want_dirs {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

impl SweepStore for FsStore {
    fn list_artifacts(&self) -> Result<Vec<JobId>, StoreError> {
        Ok(list_entries(&self.inputs_dir, false)?
            .iter()
            .filter_map(|name| self.inputs.job_id_from_name(name))
            .map(JobId::from_stored)
            .collect())
    }

    fn read_artifact(&self, job_id: &JobId) -> Result<Option<String>, StoreError> {
        read_optional(&self.artifact_path(job_id))
    }

    fn write_artifact(&self, job_id: &JobId, contents: &str) -> Result<(), StoreError> {
        write_atomic(&self.artifact_path(job_id), contents)
    }

    fn list_runs(&self) -> Result<Vec<JobId>, StoreError> {
        Ok(list_entries(&self.runs_dir, true)?
            .into_iter()
            .map(JobId::from_stored)
            .collect())
    }

    fn prepare_run(&self, job_id: &JobId, input: &str) -> Result<PathBuf, StoreError> {
        let dir = self.run_dir(job_id);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let marker = self.run_path(job_id, RunFile::Marker);
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&marker)(err)),
        }
        write_atomic(&self.run_path(job_id, RunFile::Input), input)?;
        Ok(dir)
    }

    fn run_path(&self, job_id: &JobId, file: RunFile) -> PathBuf {
        self.run_dir(job_id).join(self.layout_path(file))
    }

    fn read_run_file(&self, job_id: &JobId, file: RunFile) -> Result<Option<String>, StoreError> {
        read_optional(&self.run_path(job_id, file))
    }

    fn write_run_file(&self, job_id: &JobId, file: RunFile, contents: &str) -> Result<(), StoreError> {
        write_atomic(&self.run_path(job_id, file), contents)
    }

    fn append_timing(&self, record: &TimingRecord) -> Result<(), StoreError> {
        let path = &self.timing_log;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(io_err(path))?;
        let len = file.metadata().map_err(io_err(path))?.len();
        let mut line = String::new();
        if len == 0 {
            line.push_str(TIMING_HEADER);
            line.push('\n');
        } else if !ends_with_newline(&mut file, len).map_err(io_err(path))? {
            // torn tail from an interrupted append
            line.push('\n');
        }
        line.push_str(&record.to_csv_line());
        line.push('\n');
        file.write_all(line.as_bytes()).map_err(io_err(path))?;
        file.flush().map_err(io_err(path))
    }

    fn read_timings(&self) -> Result<Vec<TimingRecord>, StoreError> {
        Ok(read_optional(&self.timing_log)?
            .map(|raw| parse_timing_log(&raw))
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    artifacts: BTreeMap<JobId, String>,
    runs: BTreeMap<JobId, HashMap<RunFile, String>>,
    timing_log: String,
}

/// In-memory store for local development and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes an artifact, as an operator might.
    pub fn remove_artifact(&self, job_id: &JobId) -> bool {
        self.state.lock().artifacts.remove(job_id).is_some()
    }

    /// Deletes a whole run record.
    pub fn remove_run(&self, job_id: &JobId) -> bool {
        self.state.lock().runs.remove(job_id).is_some()
    }

    /// Deletes one run file.
    pub fn remove_run_file(&self, job_id: &JobId, file: RunFile) -> bool {
        self.state
            .lock()
            .runs
            .get_mut(job_id)
            .and_then(|files| files.remove(&file))
            .is_some()
    }

    /// Creates an empty run record, as an interrupted job leaves behind.
    pub fn create_run(&self, job_id: &JobId) {
        self.state.lock().runs.entry(job_id.clone()).or_default();
    }

    /// Raw timing log text.
    #[must_use]
    pub fn timing_log(&self) -> String {
        self.state.lock().timing_log.clone()
    }
}

impl SweepStore for MemoryStore {
    fn list_artifacts(&self) -> Result<Vec<JobId>, StoreError> {
        Ok(self.state.lock().artifacts.keys().cloned().collect())
    }

    fn read_artifact(&self, job_id: &JobId) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().artifacts.get(job_id).cloned())
    }

    fn write_artifact(&self, job_id: &JobId, contents: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .artifacts
            .insert(job_id.clone(), contents.to_string());
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<JobId>, StoreError> {
        Ok(self.state.lock().runs.keys().cloned().collect())
    }

    fn prepare_run(&self, job_id: &JobId, input: &str) -> Result<PathBuf, StoreError> {
        let mut state = self.state.lock();
        let files = state.runs.entry(job_id.clone()).or_default();
        files.remove(&RunFile::Marker);
        files.insert(RunFile::Input, input.to_string());
        Ok(PathBuf::from("memory/runs").join(job_id.as_str()))
    }

    fn run_path(&self, job_id: &JobId, file: RunFile) -> PathBuf {
        PathBuf::from("memory/runs")
            .join(job_id.as_str())
            .join(file.to_string())
    }

    fn read_run_file(&self, job_id: &JobId, file: RunFile) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .runs
            .get(job_id)
            .and_then(|files| files.get(&file).cloned()))
    }

    fn write_run_file(&self, job_id: &JobId, file: RunFile, contents: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .runs
            .entry(job_id.clone())
            .or_default()
            .insert(file, contents.to_string());
        Ok(())
    }

    fn append_timing(&self, record: &TimingRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.timing_log.is_empty() {
            state.timing_log.push_str(TIMING_HEADER);
            state.timing_log.push('\n');
        }
        state.timing_log.push_str(&record.to_csv_line());
        state.timing_log.push('\n');
        Ok(())
    }

    fn read_timings(&self) -> Result<Vec<TimingRecord>, StoreError> {
        Ok(parse_timing_log(&self.state.lock().timing_log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fs_store(root: &Path) -> FsStore {
        let mut config = SweepConfig::default();
        config.paths.inputs_dir = root.join("inlists");
        config.paths.runs_dir = root.join("runs");
        config.paths.timing_log = root.join("timing.csv");
        FsStore::from_config(&config)
    }

    fn id(raw: &str) -> JobId {
        JobId::from_stored(raw)
    }

    #[test]
    fn fs_artifacts_are_listed_by_id() {
        let tmp = tempdir().unwrap();
        let store = fs_store(tmp.path());
        assert!(store.list_artifacts().unwrap().is_empty());
        store.write_artifact(&id("M2.0000_b"), "b").unwrap();
        store.write_artifact(&id("M1.0000_a"), "a").unwrap();
        fs::write(tmp.path().join("inlists/README"), "not an artifact").unwrap();
        assert_eq!(
            store.list_artifacts().unwrap(),
            vec![id("M1.0000_a"), id("M2.0000_b")]
        );
        assert_eq!(store.read_artifact(&id("M1.0000_a")).unwrap().as_deref(), Some("a"));
        assert_eq!(store.read_artifact(&id("missing")).unwrap(), None);
        assert!(tmp.path().join("inlists/inlist_M1.0000_a.in").exists());
    }

    #[test]
    fn prepare_run_clears_stale_marker() {
        let tmp = tempdir().unwrap();
        let store = fs_store(tmp.path());
        let job = id("M1.0000_a");
        store.prepare_run(&job, "first").unwrap();
        store.write_run_file(&job, RunFile::Marker, "{}").unwrap();
        let dir = store.prepare_run(&job, "second").unwrap();
        assert_eq!(dir, tmp.path().join("runs/M1.0000_a"));
        assert_eq!(store.read_run_file(&job, RunFile::Marker).unwrap(), None);
        assert_eq!(
            store.read_run_file(&job, RunFile::Input).unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(store.list_runs().unwrap(), vec![job]);
    }

    #[test]
    fn nested_run_files_are_created() {
        let tmp = tempdir().unwrap();
        let store = fs_store(tmp.path());
        let job = id("M1.0000_a");
        store.write_run_file(&job, RunFile::History, "data").unwrap();
        assert!(tmp.path().join("runs/M1.0000_a/LOGS/history.data").exists());
    }

    #[test]
    fn timing_log_appends_with_single_header() {
        let tmp = tempdir().unwrap();
        let store = fs_store(tmp.path());
        for (job, secs) in [("a", 1.5), ("b", 2.25)] {
            store
                .append_timing(&TimingRecord {
                    job_id: id(job),
                    wall_clock_seconds: secs,
                    threads: 4,
                })
                .unwrap();
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(tmp.path().join("timing.csv"))
            .unwrap();
        file.write_all(b"c,3.").unwrap();
        let raw = fs::read_to_string(tmp.path().join("timing.csv")).unwrap();
        assert_eq!(raw.matches(TIMING_HEADER).count(), 1);
        let records = store.read_timings().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].wall_clock_seconds, 2.25);
    }

    #[test]
    fn append_after_torn_tail_keeps_new_record() {
        let tmp = tempdir().unwrap();
        let store = fs_store(tmp.path());
        let record = |job: &str, secs: f64| TimingRecord {
            job_id: id(job),
            wall_clock_seconds: secs,
            threads: 1,
        };
        store.append_timing(&record("a", 1.0)).unwrap();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(tmp.path().join("timing.csv"))
            .unwrap();
        file.write_all(b"b,2").unwrap();
        drop(file);
        store.append_timing(&record("c", 3.0)).unwrap();

        let raw = fs::read_to_string(tmp.path().join("timing.csv")).unwrap();
        assert_eq!(raw, format!("{TIMING_HEADER}\na,1,1\nb,2\nc,3,1\n"));
        let ids: Vec<_> = store
            .read_timings()
            .unwrap()
            .into_iter()
            .map(|record| record.job_id)
            .collect();
        assert_eq!(ids, vec![id("a"), id("c")]);
    }

    #[test]
    fn memory_store_mirrors_fs_semantics() {
        let store = MemoryStore::new();
        let job = id("a");
        store.prepare_run(&job, "inlist").unwrap();
        store.write_run_file(&job, RunFile::Marker, "{}").unwrap();
        store.prepare_run(&job, "inlist").unwrap();
        assert_eq!(store.read_run_file(&job, RunFile::Marker).unwrap(), None);
        store
            .append_timing(&TimingRecord {
                job_id: job.clone(),
                wall_clock_seconds: 1.0,
                threads: 1,
            })
            .unwrap();
        assert!(store.timing_log().starts_with(TIMING_HEADER));
        assert!(store.remove_run(&job));
        assert!(store.list_runs().unwrap().is_empty());
    }
}
