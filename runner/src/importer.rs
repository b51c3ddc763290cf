use crate::{config::ImporterConfig, database::NewDataset};
use gridin_ingest::process::{run_captured, ProcessError};
use std::{path::PathBuf, process::Command, time::Duration};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Failed to run the dataset importer")]
    Process(#[from] ProcessError),
    #[error("The dataset importer failed for {dataset}: {stderr}")]
    Failed { dataset: String, stderr: String },
    #[error("Failed to deserialize the description of {dataset}: {source}")]
    Deserialize {
        dataset: String,
        source: serde_json::Error,
    },
}

/// Describes datasets unknown to the database from the grid's data catalogue
pub trait DatasetImporter: Send + Sync {
    fn describe(&self, dataset: &str) -> Result<NewDataset, ImportError>;
}

/// Runs `<exec> <dataset>` and reads the dataset description as JSON from stdout
#[derive(Debug, Clone)]
pub struct ExecImporter {
    exec: PathBuf,
    timeout: Duration,
}

impl ExecImporter {
    pub fn new(exec: PathBuf, timeout: Duration) -> Self {
        Self { exec, timeout }
    }

    pub fn load(config: &ImporterConfig) -> Self {
        Self::new(config.exec.clone(), config.timeout())
    }
}

impl DatasetImporter for ExecImporter {
    #[instrument(skip(self), level = "debug")]
    fn describe(&self, dataset: &str) -> Result<NewDataset, ImportError> {
        let output = run_captured(Command::new(&self.exec).arg(dataset), self.timeout)?;

        if !output.success() {
            return Err(ImportError::Failed {
                dataset: dataset.to_owned(),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        debug!(runtime = ?output.runtime, "Dataset importer finished");

        serde_json::from_str(&output.stdout).map_err(|source| ImportError::Deserialize {
            dataset: dataset.to_owned(),
            source,
        })
    }
}
