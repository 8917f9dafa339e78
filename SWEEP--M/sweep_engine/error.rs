use thiserror::Error;

use crate::{
    config::ConfigError, naming::JobId, simulator::SimulatorFault, store::StoreError,
    table::TableError, template::TemplateError,
};

/// Errors that stop a pipeline stage.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The specification table is unusable.
    #[error("parameter table: {0}")]
    Table(#[from] TableError),
    /// The template is unusable.
    #[error("inlist template: {0}")]
    Template(#[from] TemplateError),
    /// Storage failed.
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    /// The runner's environment is broken; the queue was aborted while
    /// `job_id` was being started.
    #[error("environment fault while running {job_id}: {source}")]
    EnvironmentFault {
        /// Job in flight.
        job_id: JobId,
        /// Underlying fault.
        source: SimulatorFault,
    },
}
