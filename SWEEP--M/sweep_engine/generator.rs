use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    config::ToggleSettings,
    confirm::ConfirmationPolicy,
    naming::JobId,
    store::{StoreError, SweepStore},
    table::ParameterRow,
    telemetry::{emit, SweepTelemetry},
    template::{InputTemplate, RenderContext, TemplateError},
};

/// What happened to one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactChange {
    /// No artifact existed.
    Created,
    /// The stored artifact differed and was rewritten.
    Updated,
    /// The stored artifact was byte-identical; nothing written.
    Unchanged,
}

/// A row that could not be rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationFailure {
    /// Identifier of the row.
    pub job_id: JobId,
    /// Reason (`TemplateFieldMissing` or storage failure).
    pub reason: String,
}

/// Outcome of one generation batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationReport {
    /// Per-row change in table order.
    pub artifacts: IndexMap<JobId, ArtifactChange>,
    /// Rows that failed; the rest of the batch still ran.
    pub failures: Vec<GenerationFailure>,
    /// Toggle answers injected into every render.
    pub toggles: IndexMap<String, bool>,
}

impl GenerationReport {
    /// Number of artifacts with the given change.
    #[must_use]
    pub fn count(&self, change: ArtifactChange) -> usize {
        self.artifacts.values().filter(|c| **c == change).count()
    }
}

/// Renders one artifact per row.
pub struct InputGenerator {
    template: InputTemplate,
    store: Arc<dyn SweepStore>,
    toggles: Vec<ToggleSettings>,
    telemetry: Option<SweepTelemetry>,
}

impl InputGenerator {
    /// Creates a generator.
    #[must_use]
    pub fn new(
        template: InputTemplate,
        store: Arc<dyn SweepStore>,
        toggles: Vec<ToggleSettings>,
        telemetry: Option<SweepTelemetry>,
    ) -> Self {
        Self {
            template,
            store,
            toggles,
            telemetry,
        }
    }

    /// Placeholder names answered per batch rather than per row.
    #[must_use]
    pub fn toggle_names(&self) -> HashSet<String> {
        self.toggles.iter().map(|t| t.placeholder.clone()).collect()
    }

    /// Asks every toggle question once for the whole batch.
    pub fn resolve_toggles(&self, confirm: &dyn ConfirmationPolicy) -> Result<IndexMap<String, bool>> {
        let mut answers = IndexMap::new();
        for toggle in &self.toggles {
            let answer = confirm.confirm(&toggle.prompt, toggle.default)?;
            answers.insert(toggle.placeholder.clone(), answer);
        }
        Ok(answers)
    }

    /// Renders one artifact without touching storage.
    pub fn render(
        &self,
        row: &ParameterRow,
        toggles: &IndexMap<String, bool>,
    ) -> Result<String, TemplateError> {
        let job_id = row.job_id();
        self.template.render(&RenderContext {
            row,
            job_id: &job_id,
            toggles,
        })
    }

    /// Generates artifacts for every row. A row that fails to render or
    /// store is reported and the batch continues.
    pub fn generate(
        &self,
        rows: &[ParameterRow],
        confirm: &dyn ConfirmationPolicy,
    ) -> Result<GenerationReport> {
        let toggles = self.resolve_toggles(confirm)?;
        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "inputs.generate.start",
            None,
            json!({ "rows": rows.len(), "toggles": toggles }),
        );
        let mut report = GenerationReport {
            toggles,
            ..GenerationReport::default()
        };
        for row in rows {
            let job_id = row.job_id();
            let outcome = self
                .render(row, &report.toggles)
                .map_err(|err| err.to_string())
                .and_then(|text| self.store_artifact(&job_id, &text).map_err(|err| err.to_string()));
            match outcome {
                Ok(change) => {
                    emit(
                        self.telemetry.as_ref(),
                        LogLevel::Debug,
                        "inputs.generate.row",
                        Some(job_id.as_str()),
                        json!({ "change": change, "row": row.sequence }),
                    );
                    report.artifacts.insert(job_id, change);
                }
                Err(reason) => {
                    emit(
                        self.telemetry.as_ref(),
                        LogLevel::Error,
                        "inputs.generate.failed",
                        Some(job_id.as_str()),
                        json!({ "reason": reason, "row": row.sequence }),
                    );
                    report.failures.push(GenerationFailure { job_id, reason });
                }
            }
        }
        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "inputs.generate.completed",
            None,
            json!({
                "created": report.count(ArtifactChange::Created),
                "updated": report.count(ArtifactChange::Updated),
                "unchanged": report.count(ArtifactChange::Unchanged),
                "failed": report.failures.len(),
            }),
        );
        Ok(report)
    }

    fn store_artifact(&self, job_id: &JobId, text: &str) -> Result<ArtifactChange, StoreError> {
        let change = match self.store.read_artifact(job_id)? {
            Some(existing) if existing == text => return Ok(ArtifactChange::Unchanged),
            Some(_) => ArtifactChange::Updated,
            None => ArtifactChange::Created,
        };
        self.store.write_artifact(job_id, text)?;
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryStore, table::ParameterTable};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingYes(AtomicUsize);

    impl ConfirmationPolicy for CountingYes {
        fn confirm(&self, _prompt: &str, _default: bool) -> Result<bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn table() -> ParameterTable {
        ParameterTable::parse(
            "mass,metallicity,overshoot_scheme,f_ov\n1.0,0.014,exponential,0.016\n2.0,0.02,none,\n",
        )
        .unwrap()
    }

    fn generator(store: Arc<MemoryStore>, template: &str) -> InputGenerator {
        InputGenerator::new(
            InputTemplate::parse(template).unwrap(),
            store,
            vec![ToggleSettings {
                placeholder: "use_colors".into(),
                prompt: "Enable colors?".into(),
                default: false,
            }],
            None,
        )
    }

    #[test]
    fn asks_toggle_once_per_batch() {
        let store = Arc::new(MemoryStore::new());
        let gen = generator(store.clone(), "m = {{mass}}\nc = {{use_colors}}\n");
        let confirm = CountingYes(AtomicUsize::new(0));
        let report = gen.generate(table().rows(), &confirm).unwrap();
        assert_eq!(confirm.0.load(Ordering::SeqCst), 1);
        assert_eq!(report.count(ArtifactChange::Created), 2);
        for id in store.list_artifacts().unwrap() {
            assert!(store.read_artifact(&id).unwrap().unwrap().contains("c = .true."));
        }
    }

    #[test]
    fn regeneration_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let gen = generator(store.clone(), "m = {{mass}}\nz = {{metallicity}}\n");
        let table = table();
        gen.generate(table.rows(), &crate::confirm::AssumeNo).unwrap();
        let id = table.rows()[0].job_id();
        let before = store.read_artifact(&id).unwrap().unwrap();
        let report = gen.generate(table.rows(), &crate::confirm::AssumeNo).unwrap();
        assert_eq!(report.count(ArtifactChange::Unchanged), 2);
        assert_eq!(store.read_artifact(&id).unwrap().unwrap(), before);
    }

    #[test]
    fn rewrites_corrupted_artifacts() {
        let store = Arc::new(MemoryStore::new());
        let gen = generator(store.clone(), "m = {{mass}}\n");
        let table = table();
        let id = table.rows()[1].job_id();
        store.write_artifact(&id, "garbage").unwrap();
        let report = gen.generate(table.rows(), &crate::confirm::AssumeNo).unwrap();
        assert_eq!(report.artifacts[&id], ArtifactChange::Updated);
        assert_eq!(store.read_artifact(&id).unwrap().unwrap(), "m = 2.0\n");
    }

    #[test]
    fn missing_field_fails_only_that_row() {
        let store = Arc::new(MemoryStore::new());
        let gen = generator(store.clone(), "f = {{f_ov}}\n");
        let table = table();
        let report = gen.generate(table.rows(), &crate::confirm::AssumeNo).unwrap();
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].job_id, table.rows()[1].job_id());
        assert!(report.failures[0].reason.contains("f_ov"));
    }
}
