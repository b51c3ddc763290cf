use crate::{
    cleanup::CleanupError, config::ConfigErrors, database::ConnectionError,
    datasets::CatalogueError, grid::GridError, harvest::HarvestError, merge::MergeError,
    monitor::MonitorError, provenance::ProvenanceError, submit::SubmitError, task::TaskError,
    util::UtilError,
};
use thiserror::Error;

/// Everything a command can fail with
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("Dataset catalogue error: {0}")]
    Catalogue(#[from] CatalogueError),
    #[error("Task configuration error: {0}")]
    Task(#[from] TaskError),
    #[error("Grid client error: {0}")]
    Grid(#[from] GridError),
    #[error("Database error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Provenance error: {0}")]
    Provenance(#[from] ProvenanceError),
    #[error("Submission failed: {0}")]
    Submit(#[from] SubmitError),
    #[error("Monitoring failed: {0}")]
    Monitor(#[from] MonitorError),
    #[error("Harvesting failed: {0}")]
    Harvest(#[from] HarvestError),
    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("Cleanup failed: {0}")]
    Cleanup(#[from] CleanupError),
    #[error(transparent)]
    Util(#[from] UtilError),
    #[error("{failed} of {total} items failed")]
    Partial { failed: u64, total: usize },
}
