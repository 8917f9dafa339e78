use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    mesa_data::{DataFileError, MesaTable},
    naming::JobId,
    report::{OutputReport, RunStatus},
    store::{CompletionMarker, RunFile, StoreError, SweepStore, TimingRecord},
    table::{csv_escape, FieldValue, ParameterRow},
    telemetry::{emit, SweepTelemetry},
    template::format_number,
};

/// Column holding the wall-clock duration in the summary.
pub const WALL_CLOCK_COLUMN: &str = "wall_clock_seconds";

/// Why one run's metrics could not be extracted.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// A required output file is absent.
    #[error("{0} file missing")]
    MissingFile(RunFile),
    /// A required output file does not parse.
    #[error("{file} file unreadable: {source}")]
    Parse {
        /// Which file.
        file: RunFile,
        /// Parse failure.
        source: DataFileError,
    },
    /// Storage failed while reading.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
enum Source {
    History,
    Profile,
}

#[derive(Debug, Clone, Copy)]
enum Reduction {
    /// Last data row.
    Last,
    /// Maximum over all data rows.
    Max,
    /// Header value.
    Header,
}

/// One scalar pulled from a run's output.
#[derive(Debug, Clone, Copy)]
pub struct MetricSpec {
    /// Summary column name.
    pub name: &'static str,
    source: Source,
    /// Candidate columns, first present wins.
    candidates: &'static [&'static str],
    reduction: Reduction,
}

const fn history(name: &'static str, candidates: &'static [&'static str], reduction: Reduction) -> MetricSpec {
    MetricSpec {
        name,
        source: Source::History,
        candidates,
        reduction,
    }
}

const fn profile(name: &'static str, candidates: &'static [&'static str], reduction: Reduction) -> MetricSpec {
    MetricSpec {
        name,
        source: Source::Profile,
        candidates,
        reduction,
    }
}

/// Metrics extracted from every completed run, in summary column order.
pub const METRICS: &[MetricSpec] = &[
    history("final_model_number", &["model_number"], Reduction::Last),
    history("final_star_age", &["star_age"], Reduction::Last),
    history("final_star_mass", &["star_mass"], Reduction::Last),
    history("final_log_L", &["log_L"], Reduction::Last),
    history("final_log_Teff", &["log_Teff"], Reduction::Last),
    history("final_log_R", &["log_R"], Reduction::Last),
    history("final_center_h1", &["center_h1"], Reduction::Last),
    history("final_center_he4", &["center_he4"], Reduction::Last),
    history(
        "max_core_mass",
        &["he_core_mass", "mass_conv_core", "conv_mx1_top"],
        Reduction::Max,
    ),
    profile("profile_num_zones", &["num_zones"], Reduction::Header),
    profile("center_logT", &["logT"], Reduction::Last),
    profile("center_logRho", &["logRho"], Reduction::Last),
];

impl MetricSpec {
    fn extract(&self, history: &MesaTable, profile: &MesaTable) -> Option<f64> {
        let table = match self.source {
            Source::History => history,
            Source::Profile => profile,
        };
        self.candidates.iter().find_map(|column| match self.reduction {
            Reduction::Last => table.last(column),
            Reduction::Header => table.header_number(column),
            Reduction::Max => table
                .column(column)?
                .into_iter()
                .filter(|v| v.is_finite())
                .reduce(f64::max),
        })
    }
}

/// One summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRow {
    /// Identifier.
    pub job_id: JobId,
    /// Table fields by column, in table order; absent optional fields are
    /// empty.
    pub fields: IndexMap<String, String>,
    /// Duration from the last timing record, else from the completion
    /// marker; `None` when neither records it.
    pub wall_clock_seconds: Option<f64>,
    /// Every metric in [`METRICS`] order, `None` when unrecoverable.
    pub metrics: IndexMap<String, Option<f64>>,
}

/// A completed run left out of the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    /// Identifier.
    pub job_id: JobId,
    /// Reason.
    pub reason: String,
}

/// Result of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationOutcome {
    /// Table columns carried into the summary.
    pub columns: Vec<String>,
    /// Summary rows in table order.
    pub rows: Vec<AggregatedRow>,
    /// Completed runs whose outputs could not be used.
    pub skipped: Vec<SkippedRow>,
}

impl AggregationOutcome {
    /// Renders the summary as CSV.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut header = vec!["job_id".to_string()];
        header.extend(self.columns.iter().cloned());
        header.push(WALL_CLOCK_COLUMN.to_string());
        header.extend(METRICS.iter().map(|m| m.name.to_string()));
        let mut out = csv_line(&header);
        for row in &self.rows {
            let mut cells = vec![row.job_id.to_string()];
            cells.extend(
                self.columns
                    .iter()
                    .map(|c| row.fields.get(c).cloned().unwrap_or_default()),
            );
            cells.push(number_cell(row.wall_clock_seconds));
            cells.extend(METRICS.iter().map(|m| number_cell(row.metrics.get(m.name).copied().flatten())));
            out.push_str(&csv_line(&cells));
        }
        out
    }
}

fn csv_line(cells: &[String]) -> String {
    let mut line = cells
        .iter()
        .map(|cell| csv_escape(cell))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

fn number_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Joins rows, timing and extracted metrics for completed runs.
pub struct ResultsAggregator {
    store: Arc<dyn SweepStore>,
    telemetry: Option<SweepTelemetry>,
}

impl ResultsAggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(store: Arc<dyn SweepStore>, telemetry: Option<SweepTelemetry>) -> Self {
        Self { store, telemetry }
    }

    /// Aggregates every row the output report classified completed and
    /// whose input copy agrees with the row.
    pub fn aggregate(
        &self,
        columns: &[String],
        rows: &[ParameterRow],
        report: &OutputReport,
    ) -> Result<AggregationOutcome> {
        let timings = last_timings(self.store.read_timings()?);
        let disagreeing: HashMap<&JobId, usize> = report
            .reconciliation
            .mismatched
            .iter()
            .map(|m| (&m.job_id, m.fields.len()))
            .collect();
        let mut outcome = AggregationOutcome {
            columns: columns.to_vec(),
            ..AggregationOutcome::default()
        };

        for row in rows {
            let job_id = row.job_id();
            if !matches!(report.statuses.get(&job_id), Some(RunStatus::Completed)) {
                continue;
            }
            if let Some(count) = disagreeing.get(&job_id) {
                self.skip(&mut outcome, job_id, format!("input copy disagrees with row in {count} field(s)"));
                continue;
            }
            let metrics = match self.extract(&job_id) {
                Ok(metrics) => metrics,
                Err(err) => {
                    self.skip(&mut outcome, job_id, err.to_string());
                    continue;
                }
            };
            let absent: Vec<&str> = metrics
                .iter()
                .filter(|(_, v)| v.is_none())
                .map(|(k, _)| k.as_str())
                .collect();
            if !absent.is_empty() {
                emit(
                    self.telemetry.as_ref(),
                    LogLevel::Warn,
                    "aggregate.metrics_missing",
                    Some(job_id.as_str()),
                    json!({ "metrics": absent }),
                );
            }
            let wall_clock_seconds = match timings.get(&job_id) {
                Some(record) => Some(record.wall_clock_seconds),
                None => {
                    let from_marker = self.marker_duration(&job_id)?;
                    emit(
                        self.telemetry.as_ref(),
                        LogLevel::Warn,
                        "aggregate.timing_missing",
                        Some(job_id.as_str()),
                        json!({ "marker_seconds": from_marker }),
                    );
                    from_marker
                }
            };
            outcome.rows.push(AggregatedRow {
                fields: columns
                    .iter()
                    .map(|c| (c.clone(), row.field(c).map(render_field).unwrap_or_default()))
                    .collect(),
                job_id,
                wall_clock_seconds,
                metrics,
            });
        }

        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "aggregate.completed",
            None,
            json!({ "rows": outcome.rows.len(), "skipped": outcome.skipped.len() }),
        );
        Ok(outcome)
    }

    fn marker_duration(&self, job_id: &JobId) -> Result<Option<f64>> {
        Ok(self
            .store
            .read_run_file(job_id, RunFile::Marker)?
            .and_then(|raw| CompletionMarker::from_json(&raw).ok())
            .map(|marker| marker.wall_clock_seconds))
    }

    /// Extracts every metric of one run.
    pub fn extract(&self, job_id: &JobId) -> Result<IndexMap<String, Option<f64>>, ExtractionError> {
        let history = self.load(job_id, RunFile::History)?;
        let profile = self.load(job_id, RunFile::Profile)?;
        Ok(METRICS
            .iter()
            .map(|spec| (spec.name.to_string(), spec.extract(&history, &profile)))
            .collect())
    }

    fn load(&self, job_id: &JobId, file: RunFile) -> Result<MesaTable, ExtractionError> {
        let raw = self
            .store
            .read_run_file(job_id, file)?
            .ok_or(ExtractionError::MissingFile(file))?;
        MesaTable::parse(&raw).map_err(|source| ExtractionError::Parse { file, source })
    }

    fn skip(&self, outcome: &mut AggregationOutcome, job_id: JobId, reason: String) {
        emit(
            self.telemetry.as_ref(),
            LogLevel::Warn,
            "aggregate.row_skipped",
            Some(job_id.as_str()),
            json!({ "reason": reason }),
        );
        outcome.skipped.push(SkippedRow { job_id, reason });
    }
}

fn render_field(value: FieldValue) -> String {
    match value {
        FieldValue::Number(number) => format_number(number),
        FieldValue::Text(text) => text,
    }
}

/// Keeps the last timing record per job; reruns append newer lines.
fn last_timings(records: Vec<TimingRecord>) -> HashMap<JobId, TimingRecord> {
    records
        .into_iter()
        .map(|record| (record.job_id.clone(), record))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        report::{FieldMismatch, Mismatch},
        store::{MarkerStatus, MemoryStore},
        table::ParameterTable,
    };

    const HISTORY: &str = "\
1 2
version_number initial_mass
\"r24.08.1\" 1.0

1 2 3 4 5 6 7 8 9 10
model_number star_age star_mass log_L log_Teff log_R center_h1 center_he4 he_core_mass extra
1 1.0D+02 1.0 0.1 3.76 0.0 0.70 0.28 0.00 1
250 9.5D+09 0.99 0.35 3.75 0.1 0.00 0.98 0.12 1
";

    const PROFILE: &str = "\
1 2
model_number num_zones
250 812

1 2 3
zone logT logRho
1 3.7 -7.2
812 7.4 2.3
";

    fn table() -> ParameterTable {
        ParameterTable::parse(
            "mass,metallicity,overshoot_scheme,f_ov,note\n\
             1.0,0.014,exponential,0.016,solar\n\
             2.0,0.014,none,,\n\
             3.0,0.014,none,,\n",
        )
        .unwrap()
    }

    fn completed(report: &mut OutputReport, id: &JobId) {
        report.statuses.insert(id.clone(), RunStatus::Completed);
    }

    fn timing(store: &MemoryStore, id: &JobId, secs: f64) {
        store
            .append_timing(&TimingRecord {
                job_id: id.clone(),
                wall_clock_seconds: secs,
                threads: 2,
            })
            .unwrap();
    }

    #[test]
    fn joins_rows_timing_and_metrics() {
        let table = table();
        let ids: Vec<JobId> = table.rows().iter().map(ParameterRow::job_id).collect();
        let store = Arc::new(MemoryStore::new());
        let mut report = OutputReport::default();
        for id in &ids[..2] {
            store.write_run_file(id, RunFile::History, HISTORY).unwrap();
            store.write_run_file(id, RunFile::Profile, PROFILE).unwrap();
            completed(&mut report, id);
        }
        report.statuses.insert(ids[2].clone(), RunStatus::Incomplete);
        timing(&store, &ids[0], 10.0);
        timing(&store, &ids[0], 12.5);

        let outcome = ResultsAggregator::new(store, None)
            .aggregate(table.columns(), table.rows(), &report)
            .unwrap();
        assert_eq!(outcome.rows.len(), 2);
        let first = &outcome.rows[0];
        assert_eq!(first.fields["mass"], "1.0");
        assert_eq!(first.fields["note"], "solar");
        assert_eq!(first.wall_clock_seconds, Some(12.5));
        assert_eq!(first.metrics["final_model_number"], Some(250.0));
        assert_eq!(first.metrics["final_star_age"], Some(9.5e9));
        assert_eq!(first.metrics["max_core_mass"], Some(0.12));
        assert_eq!(first.metrics["profile_num_zones"], Some(812.0));
        assert_eq!(first.metrics["center_logT"], Some(7.4));
        assert_eq!(outcome.rows[1].fields["f_ov"], "");
        assert_eq!(outcome.rows[1].wall_clock_seconds, None);
    }

    #[test]
    fn marker_duration_fills_missing_timing() {
        let table = table();
        let id = table.rows()[0].job_id();
        let store = Arc::new(MemoryStore::new());
        store.write_run_file(&id, RunFile::History, HISTORY).unwrap();
        store.write_run_file(&id, RunFile::Profile, PROFILE).unwrap();
        let marker = CompletionMarker {
            job_id: id.clone(),
            status: MarkerStatus::Completed,
            exit_code: Some(0),
            signal: None,
            timed_out: false,
            wall_clock_seconds: 7.75,
            threads: 2,
            finished_at: chrono::Utc::now(),
        };
        store
            .write_run_file(&id, RunFile::Marker, &marker.to_json().unwrap())
            .unwrap();
        let mut report = OutputReport::default();
        completed(&mut report, &id);

        let outcome = ResultsAggregator::new(store, None)
            .aggregate(table.columns(), &table.rows()[..1], &report)
            .unwrap();
        assert_eq!(outcome.rows[0].wall_clock_seconds, Some(7.75));
    }

    #[test]
    fn absent_metrics_stay_in_row() {
        let table = table();
        let id = table.rows()[0].job_id();
        let store = Arc::new(MemoryStore::new());
        let trimmed = HISTORY.replace("he_core_mass", "mass_conv_core").replace(" log_R ", " radius ");
        store.write_run_file(&id, RunFile::History, &trimmed).unwrap();
        store.write_run_file(&id, RunFile::Profile, PROFILE).unwrap();
        let mut report = OutputReport::default();
        completed(&mut report, &id);
        let outcome = ResultsAggregator::new(store, None)
            .aggregate(table.columns(), table.rows(), &report)
            .unwrap();
        let row = &outcome.rows[0];
        assert_eq!(row.metrics.len(), METRICS.len());
        assert_eq!(row.metrics["final_log_R"], None);
        assert_eq!(row.metrics["max_core_mass"], Some(0.12));
    }

    #[test]
    fn unparseable_outputs_skip_only_that_row() {
        let table = table();
        let ids: Vec<JobId> = table.rows().iter().map(ParameterRow::job_id).collect();
        let store = Arc::new(MemoryStore::new());
        let mut report = OutputReport::default();
        for id in &ids {
            store.write_run_file(id, RunFile::History, HISTORY).unwrap();
            store.write_run_file(id, RunFile::Profile, PROFILE).unwrap();
            completed(&mut report, id);
        }
        store.write_run_file(&ids[0], RunFile::History, "garbage").unwrap();
        store.remove_run_file(&ids[1], RunFile::Profile);
        let outcome = ResultsAggregator::new(store, None)
            .aggregate(table.columns(), table.rows(), &report)
            .unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].job_id, ids[2]);
        assert_eq!(outcome.skipped.len(), 2);
        assert!(outcome.skipped[1].reason.contains("profile file missing"));
    }

    #[test]
    fn rows_with_disagreeing_inputs_are_skipped() {
        let table = table();
        let id = table.rows()[0].job_id();
        let store = Arc::new(MemoryStore::new());
        store.write_run_file(&id, RunFile::History, HISTORY).unwrap();
        store.write_run_file(&id, RunFile::Profile, PROFILE).unwrap();
        let mut report = OutputReport::default();
        completed(&mut report, &id);
        report.reconciliation.mismatched.push(Mismatch {
            job_id: id.clone(),
            fields: vec![FieldMismatch {
                field: "mass".into(),
                key: "initial_mass".into(),
                expected: "1.0".into(),
                found: Some("1.5".into()),
            }],
        });
        let outcome = ResultsAggregator::new(store, None)
            .aggregate(table.columns(), table.rows(), &report)
            .unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.skipped[0].job_id, id);
    }

    #[test]
    fn csv_has_fixed_column_order() {
        let mut metrics = IndexMap::new();
        for spec in METRICS {
            metrics.insert(spec.name.to_string(), None);
        }
        metrics.insert("final_star_age".to_string(), Some(1.5e9));
        let outcome = AggregationOutcome {
            columns: vec!["mass".into(), "note".into()],
            rows: vec![AggregatedRow {
                job_id: JobId::from_stored("M1.0000"),
                fields: [("mass".to_string(), "1.0".to_string()), ("note".to_string(), "a, b".to_string())]
                    .into_iter()
                    .collect(),
                wall_clock_seconds: Some(3.25),
                metrics,
            }],
            skipped: Vec::new(),
        };
        let csv = outcome.to_csv();
        let mut lines = csv.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("job_id,mass,note,wall_clock_seconds,final_model_number,final_star_age"));
        assert!(header.ends_with("center_logRho"));
        assert_eq!(lines.next().unwrap(), "M1.0000,1.0,\"a, b\",3.25,,1500000000,,,,,,,,,,");
    }
}
