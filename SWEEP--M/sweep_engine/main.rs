use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    aggregator::{AggregationOutcome, ResultsAggregator},
    config::SweepConfig,
    confirm::ConfirmationPolicy,
    error::SweepError,
    generator::{GenerationReport, InputGenerator},
    input_verifier::InputVerifier,
    output_verifier::OutputVerifier,
    report::{OutputCounts, OutputReport, ReconcileCounts, VerificationReport},
    runner::{JobRunner, RunSummary, RunnerOptions},
    simulator::{ProcessBackend, SimulatorBackend},
    store::{FsStore, SweepStore},
    table::ParameterTable,
    telemetry::{emit, SweepTelemetry},
    template::InputTemplate,
};

/// Combined view of every state surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStatus {
    /// Rows in the table.
    pub rows: usize,
    /// Table ↔ input artifact counts.
    pub inputs: ReconcileCounts,
    /// Table ↔ run record counts and completion classes.
    pub outputs: OutputCounts,
    /// Distinct jobs present in the timing log.
    pub timed_jobs: usize,
}

/// Parameter sweep pipeline over one table, template and store.
pub struct SweepEngine {
    config: SweepConfig,
    table: ParameterTable,
    template: InputTemplate,
    store: Arc<dyn SweepStore>,
    backend: Arc<dyn SimulatorBackend>,
    telemetry: Option<SweepTelemetry>,
}

impl SweepEngine {
    /// Returns a builder over `config`.
    #[must_use]
    pub fn builder(config: SweepConfig) -> SweepEngineBuilder {
        SweepEngineBuilder::new(config)
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Loaded table.
    #[must_use]
    pub const fn table(&self) -> &ParameterTable {
        &self.table
    }

    /// Telemetry handle.
    #[must_use]
    pub fn telemetry(&self) -> Option<&SweepTelemetry> {
        self.telemetry.as_ref()
    }

    fn toggle_names(&self) -> std::collections::HashSet<String> {
        self.config
            .inputs
            .toggles
            .iter()
            .map(|t| t.placeholder.clone())
            .collect()
    }

    /// Stage 1: renders one input artifact per row.
    pub fn generate_inputs(&self, confirm: &dyn ConfirmationPolicy) -> Result<GenerationReport> {
        InputGenerator::new(
            self.template.clone(),
            self.store.clone(),
            self.config.inputs.toggles.clone(),
            self.telemetry.clone(),
        )
        .generate(self.table.rows(), confirm)
    }

    /// Stage 2: reconciles the table with the input artifacts.
    pub fn verify_inputs(&self) -> Result<VerificationReport> {
        InputVerifier::new(
            self.template.clone(),
            self.store.clone(),
            self.toggle_names(),
            self.telemetry.clone(),
        )
        .verify(self.table.rows())
    }

    /// Stage 3: runs every pending job behind the confirmation gate.
    pub async fn run_jobs(
        &self,
        confirm: &dyn ConfirmationPolicy,
        rerun_failed: bool,
    ) -> Result<RunSummary> {
        let options = RunnerOptions {
            threads: self.config.simulator.threads,
            rerun_failed,
        };
        JobRunner::new(
            self.store.clone(),
            self.backend.clone(),
            options,
            self.telemetry.clone(),
        )
        .run(self.table.rows(), confirm)
        .await
    }

    /// Stage 4: reconciles the table with run records and classifies runs.
    pub fn verify_outputs(&self) -> Result<OutputReport> {
        self.output_verifier().verify(self.table.rows())
    }

    fn output_verifier(&self) -> OutputVerifier {
        OutputVerifier::new(
            self.template.clone(),
            self.store.clone(),
            self.toggle_names(),
            self.config.simulator.normal_termination.clone(),
            self.telemetry.clone(),
        )
    }

    /// Stage 5: classifies runs afresh and aggregates the completed ones.
    pub fn aggregate(&self) -> Result<AggregationOutcome> {
        let report = self.verify_outputs()?;
        ResultsAggregator::new(self.store.clone(), self.telemetry.clone()).aggregate(
            self.table.columns(),
            self.table.rows(),
            &report,
        )
    }

    /// Writes the summary CSV to `path`, or to `paths.summary` when `None`.
    pub fn write_summary(&self, outcome: &AggregationOutcome, path: Option<&Path>) -> Result<PathBuf> {
        let path = path.map_or_else(|| self.config.paths.summary.clone(), Path::to_path_buf);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&path, outcome.to_csv()).with_context(|| format!("writing {}", path.display()))?;
        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "aggregate.summary_written",
            None,
            json!({ "path": path, "rows": outcome.rows.len() }),
        );
        Ok(path)
    }

    /// Counts across all state surfaces without changing anything.
    pub fn status(&self) -> Result<SweepStatus> {
        let inputs = self.verify_inputs()?.counts();
        let outputs = self.verify_outputs()?.counts();
        let mut timed: Vec<_> = self
            .store
            .read_timings()?
            .into_iter()
            .map(|record| record.job_id)
            .collect();
        timed.sort();
        timed.dedup();
        Ok(SweepStatus {
            rows: self.table.len(),
            inputs,
            outputs,
            timed_jobs: timed.len(),
        })
    }
}

/// Builder for [`SweepEngine`]. Anything not supplied is loaded or built
/// from the configuration.
pub struct SweepEngineBuilder {
    config: SweepConfig,
    table: Option<ParameterTable>,
    template: Option<InputTemplate>,
    store: Option<Arc<dyn SweepStore>>,
    backend: Option<Arc<dyn SimulatorBackend>>,
    telemetry: Option<SweepTelemetry>,
}

impl SweepEngineBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(config: SweepConfig) -> Self {
        Self {
            config,
            table: None,
            template: None,
            store: None,
            backend: None,
            telemetry: None,
        }
    }

    /// Uses an already loaded table.
    #[must_use]
    pub fn table(mut self, table: ParameterTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Uses an already parsed template.
    #[must_use]
    pub fn template(mut self, template: InputTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Replaces the filesystem store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SweepStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the process backend.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn SimulatorBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: SweepTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the engine. Table errors, including identifier collisions, and
    /// templates with fields that cannot be read back are fatal here.
    pub fn build(self) -> Result<SweepEngine, SweepError> {
        let table = match self.table {
            Some(table) => table,
            None => ParameterTable::load(&self.config.paths.table)?,
        };
        let template = match self.template {
            Some(template) => template,
            None => InputTemplate::load(&self.config.paths.template)?,
        };
        let toggle_names: std::collections::HashSet<String> = self
            .config
            .inputs
            .toggles
            .iter()
            .map(|t| t.placeholder.clone())
            .collect();
        template.ensure_verifiable(&toggle_names)?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FsStore::from_config(&self.config)));
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(ProcessBackend::from_settings(&self.config.simulator)));
        emit(
            self.telemetry.as_ref(),
            LogLevel::Debug,
            "engine.ready",
            None,
            json!({ "rows": table.len(), "columns": table.columns() }),
        );
        Ok(SweepEngine {
            config: self.config,
            table,
            template,
            store,
            backend,
            telemetry: self.telemetry,
        })
    }
}
