use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    naming::JobId,
    report::{FieldMismatch, OutputReport, RunStatus, VerificationReport},
    store::{CompletionMarker, MarkerStatus, RunFile, SweepStore},
    table::ParameterRow,
    telemetry::{emit, SweepTelemetry},
    template::InputTemplate,
};

/// Reconciles the table with run records and classifies each run. Never
/// writes.
pub struct OutputVerifier {
    template: InputTemplate,
    store: Arc<dyn SweepStore>,
    toggle_names: HashSet<String>,
    normal_termination: Option<String>,
    telemetry: Option<SweepTelemetry>,
}

impl OutputVerifier {
    /// Creates a verifier. When `normal_termination` is set, a completed
    /// run's log must contain it.
    #[must_use]
    pub fn new(
        template: InputTemplate,
        store: Arc<dyn SweepStore>,
        toggle_names: HashSet<String>,
        normal_termination: Option<String>,
        telemetry: Option<SweepTelemetry>,
    ) -> Self {
        Self {
            template,
            store,
            toggle_names,
            normal_termination,
            telemetry,
        }
    }

    /// Builds the report over every row.
    pub fn verify(&self, rows: &[ParameterRow]) -> Result<OutputReport> {
        let expected: Vec<JobId> = rows.iter().map(ParameterRow::job_id).collect();
        let stored = self.store.list_runs()?;
        let (shared, reconciliation) = VerificationReport::partition(&expected, &stored);
        let shared: HashSet<JobId> = shared.into_iter().collect();
        let mut report = OutputReport {
            reconciliation,
            ..OutputReport::default()
        };

        for (row, job_id) in rows.iter().zip(expected) {
            if !shared.contains(&job_id) {
                continue;
            }
            let status = self.classify(&job_id)?;
            if !matches!(status, RunStatus::Completed) {
                emit(
                    self.telemetry.as_ref(),
                    LogLevel::Warn,
                    "outputs.verify.not_completed",
                    Some(job_id.as_str()),
                    json!({ "status": status }),
                );
            }
            let fields = self.compare_input(row, &job_id)?;
            report.reconciliation.record(job_id.clone(), fields);
            report.statuses.insert(job_id, status);
        }

        emit(
            self.telemetry.as_ref(),
            if report.is_clean() { LogLevel::Info } else { LogLevel::Warn },
            "outputs.verify.completed",
            None,
            json!({ "counts": report.counts() }),
        );
        Ok(report)
    }

    /// Classifies one run record from its marker and log.
    pub fn classify(&self, job_id: &JobId) -> Result<RunStatus> {
        let Some(raw) = self.store.read_run_file(job_id, RunFile::Marker)? else {
            return Ok(RunStatus::Incomplete);
        };
        let marker = match CompletionMarker::from_json(&raw) {
            Ok(marker) => marker,
            Err(err) => return Ok(failed(format!("unreadable completion marker: {err}"))),
        };
        if marker.job_id != *job_id {
            return Ok(failed(format!("marker belongs to {}", marker.job_id)));
        }
        if marker.status == MarkerStatus::Failed {
            return Ok(failed(marker_failure(&marker)));
        }
        let Some(log) = self.store.read_run_file(job_id, RunFile::Log)? else {
            return Ok(failed("log missing".into()));
        };
        if let Some(pattern) = &self.normal_termination {
            if !log.contains(pattern.as_str()) {
                return Ok(failed(format!("log lacks `{pattern}`")));
            }
        }
        Ok(RunStatus::Completed)
    }

    fn compare_input(&self, row: &ParameterRow, job_id: &JobId) -> Result<Vec<FieldMismatch>> {
        Ok(match self.store.read_run_file(job_id, RunFile::Input)? {
            Some(text) => self.template.compare(&text, row, job_id, &self.toggle_names),
            None => vec![FieldMismatch {
                field: "input".into(),
                key: String::new(),
                expected: format!("input copy for {job_id}"),
                found: None,
            }],
        })
    }
}

fn failed(reason: String) -> RunStatus {
    RunStatus::Failed { reason }
}

fn marker_failure(marker: &CompletionMarker) -> String {
    if marker.timed_out {
        format!("timed out after {:.1}s", marker.wall_clock_seconds)
    } else if let Some(signal) = marker.signal {
        format!("killed by signal {signal}")
    } else if let Some(code) = marker.exit_code {
        format!("exit code {code}")
    } else {
        "simulator reported failure".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryStore, table::ParameterTable};
    use chrono::Utc;

    const TEMPLATE: &str = "initial_mass = {{mass}}\ninitial_z = {{metallicity}}\n";

    fn table() -> ParameterTable {
        ParameterTable::parse(
            "mass,metallicity,overshoot_scheme\n1.0,0.014,none\n2.0,0.014,none\n3.0,0.014,none\n4.0,0.014,none\n",
        )
        .unwrap()
    }

    fn marker(job_id: &JobId, status: MarkerStatus) -> String {
        CompletionMarker {
            job_id: job_id.clone(),
            status,
            exit_code: Some(if status == MarkerStatus::Completed { 0 } else { 2 }),
            signal: None,
            timed_out: false,
            wall_clock_seconds: 1.0,
            threads: 1,
            finished_at: Utc::now(),
        }
        .to_json()
        .unwrap()
    }

    fn finished(store: &MemoryStore, row: &ParameterRow, status: MarkerStatus, log: &str) {
        let id = row.job_id();
        let input = format!("initial_mass = {}\ninitial_z = {}\n", row.mass, row.metallicity);
        store.prepare_run(&id, &input).unwrap();
        store.write_run_file(&id, RunFile::Log, log).unwrap();
        store.write_run_file(&id, RunFile::Marker, &marker(&id, status)).unwrap();
    }

    fn verifier(store: Arc<MemoryStore>, pattern: Option<&str>) -> OutputVerifier {
        OutputVerifier::new(
            InputTemplate::parse(TEMPLATE).unwrap(),
            store,
            HashSet::new(),
            pattern.map(str::to_string),
            None,
        )
    }

    #[test]
    fn classifies_each_run_state() {
        let table = table();
        let rows = table.rows();
        let store = Arc::new(MemoryStore::new());
        finished(&store, &rows[0], MarkerStatus::Completed, "termination code: max_age\n");
        finished(&store, &rows[1], MarkerStatus::Failed, "boom\n");
        store.prepare_run(&rows[2].job_id(), "initial_mass = 3.0\ninitial_z = 0.014\n").unwrap();
        let orphan = JobId::from_stored("M9.0000_Z0.01400000_noovs_fovna_f0ovna");
        store.create_run(&orphan);

        let report = verifier(store, Some("termination code")).verify(rows).unwrap();
        assert_eq!(report.statuses[&rows[0].job_id()], RunStatus::Completed);
        assert_eq!(
            report.statuses[&rows[1].job_id()],
            RunStatus::Failed {
                reason: "exit code 2".into()
            }
        );
        assert_eq!(report.incomplete(), vec![rows[2].job_id()]);
        assert_eq!(report.reconciliation.missing, vec![rows[3].job_id()]);
        assert_eq!(report.reconciliation.orphaned, vec![orphan]);
        assert_eq!(report.reconciliation.matched.len(), 3);
        assert!(!report.is_clean());
    }

    #[test]
    fn completed_marker_needs_normal_termination_in_log() {
        let table = table();
        let store = Arc::new(MemoryStore::new());
        finished(&store, &table.rows()[0], MarkerStatus::Completed, "segfault\n");
        let id = table.rows()[0].job_id();
        let strict = verifier(store.clone(), Some("termination code"));
        assert!(matches!(strict.classify(&id).unwrap(), RunStatus::Failed { .. }));
        assert_eq!(verifier(store.clone(), None).classify(&id).unwrap(), RunStatus::Completed);
        store.remove_run_file(&id, RunFile::Log);
        assert!(matches!(
            verifier(store, None).classify(&id).unwrap(),
            RunStatus::Failed { reason } if reason == "log missing"
        ));
    }

    #[test]
    fn corrupt_marker_is_failed() {
        let table = table();
        let store = Arc::new(MemoryStore::new());
        let id = table.rows()[0].job_id();
        store.prepare_run(&id, "").unwrap();
        store.write_run_file(&id, RunFile::Marker, "{ not json").unwrap();
        assert!(matches!(
            verifier(store, None).classify(&id).unwrap(),
            RunStatus::Failed { .. }
        ));
    }

    #[test]
    fn input_copy_must_match_row() {
        let table = table();
        let rows = &table.rows()[..1];
        let store = Arc::new(MemoryStore::new());
        finished(&store, &rows[0], MarkerStatus::Completed, "ok\n");
        let id = rows[0].job_id();
        store
            .write_run_file(&id, RunFile::Input, "initial_mass = 1.5\ninitial_z = 0.014\n")
            .unwrap();
        let report = verifier(store.clone(), None).verify(rows).unwrap();
        assert_eq!(report.reconciliation.mismatched[0].fields[0].field, "mass");
        assert_eq!(report.statuses[&id], RunStatus::Completed);

        store.remove_run_file(&id, RunFile::Input);
        let report = verifier(store, None).verify(rows).unwrap();
        assert_eq!(report.reconciliation.mismatched[0].fields[0].field, "input");
    }
}
