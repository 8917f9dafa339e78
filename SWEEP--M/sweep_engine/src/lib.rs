#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Stellar Sweep Engine – deterministic job naming, inlist generation, resumable simulator runs,
//! table ↔ artifact reconciliation and results aggregation for parameter sweeps.

/// Structured telemetry for the sweep engine.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// `sweep.toml` configuration.
#[path = "../config.rs"]
pub mod config;

/// Pipeline-stopping errors.
#[path = "../error.rs"]
pub mod error;

/// Specification table loading and validation.
#[path = "../table.rs"]
pub mod table;

/// Canonical job identifiers.
#[path = "../naming.rs"]
pub mod naming;

/// Inlist templates: rendering and read-back.
#[path = "../template.rs"]
pub mod template;

/// Reconciliation reports.
#[path = "../report.rs"]
pub mod report;

/// Storage of artifacts, run records and timing.
#[path = "../store.rs"]
pub mod store;

/// Confirmation policies for costly or optional steps.
#[path = "../confirm.rs"]
pub mod confirm;

/// Input artifact generation.
#[path = "../generator.rs"]
pub mod generator;

/// Table ↔ input artifact verification.
#[path = "../input_verifier.rs"]
pub mod input_verifier;

/// Simulator subprocess backends.
#[path = "../simulator.rs"]
pub mod simulator;

/// Sequential, resumable job runner.
#[path = "../runner.rs"]
pub mod runner;

/// Table ↔ run record verification.
#[path = "../output_verifier.rs"]
pub mod output_verifier;

/// History and profile file reader.
#[path = "../mesa_data.rs"]
pub mod mesa_data;

/// Metric extraction and summary table.
#[path = "../aggregator.rs"]
pub mod aggregator;

/// Runtime entry & CLI hooks.
#[path = "../main.rs"]
pub mod runtime;

pub use config::SweepConfig;
pub use error::SweepError;
pub use naming::{job_id, JobId};
pub use runtime::{SweepEngine, SweepEngineBuilder, SweepStatus};
pub use telemetry::{SweepTelemetry, SweepTelemetryBuilder};
