use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    naming::JobId,
    report::{FieldMismatch, VerificationReport},
    store::SweepStore,
    table::ParameterRow,
    telemetry::{emit, SweepTelemetry},
    template::InputTemplate,
};

/// Reconciles the table with the stored input artifacts. Never writes.
pub struct InputVerifier {
    template: InputTemplate,
    store: Arc<dyn SweepStore>,
    toggle_names: HashSet<String>,
    telemetry: Option<SweepTelemetry>,
}

impl InputVerifier {
    /// Creates a verifier. `toggle_names` are placeholders answered per
    /// batch, which are not compared against rows.
    #[must_use]
    pub fn new(
        template: InputTemplate,
        store: Arc<dyn SweepStore>,
        toggle_names: HashSet<String>,
        telemetry: Option<SweepTelemetry>,
    ) -> Self {
        Self {
            template,
            store,
            toggle_names,
            telemetry,
        }
    }

    /// Builds the report. Storage listing failures are returned; a single
    /// unreadable artifact is reported as a mismatch.
    pub fn verify(&self, rows: &[ParameterRow]) -> Result<VerificationReport> {
        let expected: Vec<JobId> = rows.iter().map(ParameterRow::job_id).collect();
        let stored = self.store.list_artifacts()?;
        let (shared, mut report) = VerificationReport::partition(&expected, &stored);
        let shared: HashSet<JobId> = shared.into_iter().collect();

        for (row, job_id) in rows.iter().zip(expected) {
            if !shared.contains(&job_id) {
                continue;
            }
            let fields = match self.store.read_artifact(&job_id) {
                Ok(Some(text)) => self.template.compare(&text, row, &job_id, &self.toggle_names),
                Ok(None) => vec![unreadable(&job_id, "artifact vanished during verification")],
                Err(err) => vec![unreadable(&job_id, &err.to_string())],
            };
            if !fields.is_empty() {
                emit(
                    self.telemetry.as_ref(),
                    LogLevel::Warn,
                    "inputs.verify.mismatch",
                    Some(job_id.as_str()),
                    json!({ "fields": fields.iter().map(ToString::to_string).collect::<Vec<_>>() }),
                );
            }
            report.record(job_id, fields);
        }

        emit(
            self.telemetry.as_ref(),
            if report.is_clean() { LogLevel::Info } else { LogLevel::Warn },
            "inputs.verify.completed",
            None,
            json!({ "counts": report.counts(), "missing": report.missing, "orphaned": report.orphaned }),
        );
        Ok(report)
    }
}

fn unreadable(job_id: &JobId, reason: &str) -> FieldMismatch {
    FieldMismatch {
        field: "artifact".into(),
        key: String::new(),
        expected: format!("readable input for {job_id}"),
        found: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MemoryStore,
        table::ParameterTable,
        template::RenderContext,
    };
    use indexmap::IndexMap;

    const TEMPLATE: &str = "\
&controls
  initial_mass = {{mass}}
  initial_z = {{metallicity}}
  overshoot_f(1) = {{f_ov|0.0}}
  use_colors = {{use_colors}}
/
";

    fn table() -> ParameterTable {
        ParameterTable::parse(
            "mass,metallicity,overshoot_scheme,f_ov\n\
             1.0,0.014,exponential,0.016\n\
             1.5,0.014,exponential,0.016\n\
             2.0,0.02,none,\n",
        )
        .unwrap()
    }

    fn populate(store: &MemoryStore, template: &InputTemplate, rows: &[ParameterRow]) {
        let mut toggles = IndexMap::new();
        toggles.insert("use_colors".to_string(), true);
        for row in rows {
            let job_id = row.job_id();
            let text = template
                .render(&RenderContext {
                    row,
                    job_id: &job_id,
                    toggles: &toggles,
                })
                .unwrap();
            store.write_artifact(&job_id, &text).unwrap();
        }
    }

    fn verifier(store: Arc<MemoryStore>) -> InputVerifier {
        InputVerifier::new(
            InputTemplate::parse(TEMPLATE).unwrap(),
            store,
            std::iter::once("use_colors".to_string()).collect(),
            None,
        )
    }

    #[test]
    fn fresh_generation_verifies_clean() {
        let store = Arc::new(MemoryStore::new());
        let table = table();
        populate(&store, &InputTemplate::parse(TEMPLATE).unwrap(), table.rows());
        let report = verifier(store).verify(table.rows()).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.matched.len(), 3);
    }

    #[test]
    fn detects_missing_orphan_and_edited_artifacts() {
        let store = Arc::new(MemoryStore::new());
        let table = table();
        populate(&store, &InputTemplate::parse(TEMPLATE).unwrap(), table.rows());
        let ids: Vec<JobId> = table.rows().iter().map(ParameterRow::job_id).collect();

        store.remove_artifact(&ids[0]);
        let edited = store
            .read_artifact(&ids[1])
            .unwrap()
            .unwrap()
            .replace("initial_mass = 1.5", "initial_mass = 1.6");
        store.write_artifact(&ids[1], &edited).unwrap();
        let orphan = JobId::from_stored("M9.0000_Z0.02000000_noovs_fovna_f0ovna");
        store.write_artifact(&orphan, "initial_mass = 9.0").unwrap();

        let before = store.list_artifacts().unwrap();
        let report = verifier(store.clone()).verify(table.rows()).unwrap();
        assert_eq!(report.missing, vec![ids[0].clone()]);
        assert_eq!(report.orphaned, vec![orphan]);
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.mismatched[0].job_id, ids[1]);
        assert_eq!(report.mismatched[0].fields[0].field, "mass");
        assert_eq!(report.matched, vec![ids[2].clone()]);
        assert_eq!(store.list_artifacts().unwrap(), before);
    }

    #[test]
    fn one_deleted_artifact_is_the_only_finding() {
        let store = Arc::new(MemoryStore::new());
        let table = table();
        let rows = table.rows();
        populate(&store, &InputTemplate::parse(TEMPLATE).unwrap(), rows);
        let gone = rows[1].job_id();
        assert!(store.remove_artifact(&gone));

        let report = verifier(store).verify(rows).unwrap();
        assert_eq!(report.missing, vec![gone]);
        assert_eq!(report.matched.len(), rows.len() - 1);
        assert!(report.orphaned.is_empty());
        assert!(report.mismatched.is_empty());
    }

    #[test]
    fn toggle_answers_are_not_compared() {
        let store = Arc::new(MemoryStore::new());
        let table = table();
        populate(&store, &InputTemplate::parse(TEMPLATE).unwrap(), table.rows());
        let id = table.rows()[0].job_id();
        let flipped = store
            .read_artifact(&id)
            .unwrap()
            .unwrap()
            .replace(".true.", ".false.");
        store.write_artifact(&id, &flipped).unwrap();
        assert!(verifier(store).verify(table.rows()).unwrap().is_clean());
    }
}
