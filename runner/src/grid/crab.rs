use super::{GridClient, GridError, OutputListing, TaskReport, TaskStatus};
use crate::config::ClientConfig;
use gridin_ingest::process::run_captured;
use serde::de::DeserializeOwned;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{debug, instrument, trace};

const MISSING_CACHE_MARKER: &str = "CachefileNotFound";
const TRANSIENT_MARKERS: [&str; 3] = ["HTTPException", "HTTP Error", "HTTPError"];

/// Drives the grid scheduler client through a JSON speaking wrapper.
///
/// Every command is run as `<exec> [params] <command> --dir <task dir>`,
/// submission as `<exec> [params] submit --config <file>`. The answer is read from stdout as JSON.
#[derive(Debug, Clone)]
pub struct CrabClient {
    exec: PathBuf,
    params: Vec<String>,
    timeout: Duration,
}

impl CrabClient {
    pub fn new(exec: PathBuf, params: Vec<String>, timeout: Duration) -> Self {
        Self {
            exec,
            params,
            timeout,
        }
    }

    pub fn load(config: &ClientConfig) -> Self {
        Self::new(config.exec.clone(), config.params.clone(), config.timeout())
    }

    fn run(&self, command: &str, flag: &str, target: &Path) -> Result<String, GridError> {
        let output = run_captured(
            Command::new(&self.exec)
                .args(&self.params)
                .arg(command)
                .arg(flag)
                .arg(OsStr::new(target)),
            self.timeout,
        )?;

        debug!(
            command = command,
            target = ?target,
            runtime = ?output.runtime,
            success = output.success(),
            "Grid client finished"
        );
        trace!("Output: {}", output.stdout);

        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify(command, target, output.stderr))
        }
    }

    fn query<T: DeserializeOwned>(&self, command: &str, task_dir: &Path) -> Result<T, GridError> {
        let stdout = self.run(command, "--dir", task_dir)?;

        serde_json::from_str(&stdout).map_err(|source| GridError::Deserialize {
            command: command.to_owned(),
            source,
        })
    }
}

fn classify(command: &str, target: &Path, stderr: String) -> GridError {
    if stderr.contains(MISSING_CACHE_MARKER) {
        GridError::MissingTaskCache {
            dir: target.to_string_lossy().into_owned(),
        }
    } else if TRANSIENT_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        GridError::Transient {
            command: command.to_owned(),
            stderr,
        }
    } else {
        GridError::Failed {
            command: command.to_owned(),
            stderr,
        }
    }
}

impl GridClient for CrabClient {
    #[instrument(skip(self), level = "debug")]
    fn submit(&self, config_file: &Path) -> Result<(), GridError> {
        self.run("submit", "--config", config_file).map(|_| ())
    }

    #[instrument(skip(self), level = "debug")]
    fn status(&self, task_dir: &Path) -> Result<TaskStatus, GridError> {
        self.query("status", task_dir)
    }

    #[instrument(skip(self), level = "debug")]
    fn report(&self, task_dir: &Path) -> Result<TaskReport, GridError> {
        self.query("report", task_dir)
    }

    #[instrument(skip(self), level = "debug")]
    fn output_files(&self, task_dir: &Path) -> Result<OutputListing, GridError> {
        self.query::<OutputListing>("getoutput", task_dir)?
            .checked(task_dir)
    }
}
