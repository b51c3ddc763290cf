use crate::{
    datasets::{Catalogue, DatasetOptions},
    grid::{GridClient, GridError},
    task::{TaskConfig, TaskDefaults, TaskError},
};
use ignore::WalkBuilder;
use parking_lot::Mutex;
use rayon::{prelude::*, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Configuration file {name:?} not found inside {dir:?}")]
    PsetNotFound { name: String, dir: PathBuf },
    #[error("Configuration file {0:?} does not exist and no package directory is known to search it in")]
    PsetUnresolved(PathBuf),
    #[error("Failed to build the task configuration")]
    Task(#[from] TaskError),
    #[error("Failed to submit the task")]
    Grid(#[from] GridError),
    #[error("Failed to create {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to write the submission report")]
    Report(#[from] io::Error),
    #[error("Failed to start the worker pool")]
    Pool(#[from] ThreadPoolBuildError),
}

/// Everything the workers share
pub struct Submission<'a> {
    pub defaults: TaskDefaults,
    pub pset: PathBuf,
    pub output_file: String,
    // where crab_<name>.py files are written
    pub config_dir: PathBuf,
    // `None` only writes the configurations
    pub client: Option<&'a dyn GridClient>,
}

/// Find the parameter set, searching `package_dir` by file name when `pset` isn't a file
pub fn resolve_pset(pset: &Path, package_dir: Option<&Path>) -> Result<PathBuf, SubmitError> {
    if pset.is_file() {
        return Ok(pset.to_owned());
    }

    let Some(package_dir) = package_dir else {
        return Err(SubmitError::PsetUnresolved(pset.to_owned()));
    };
    let name = pset
        .file_name()
        .ok_or_else(|| SubmitError::PsetUnresolved(pset.to_owned()))?;

    WalkBuilder::new(package_dir)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for the configuration file: {e}");
                None
            }
        })
        .find(|entry| entry.file_name() == name && entry.path().is_file())
        .map(|entry| {
            debug!(path = ?entry.path(), "Found configuration file");
            entry.into_path()
        })
        .ok_or_else(|| SubmitError::PsetNotFound {
            name: name.to_string_lossy().into_owned(),
            dir: package_dir.to_owned(),
        })
}

impl Submission<'_> {
    #[instrument(skip(self, out, options), level = "debug")]
    fn submit_one<W: Write>(
        &self,
        out: &Mutex<W>,
        dataset: &str,
        options: &DatasetOptions,
    ) -> Result<(), SubmitError> {
        let config = TaskConfig::for_dataset(
            &self.defaults,
            &self.pset,
            &self.output_file,
            dataset,
            options,
        )?;

        // one lock per task so the lines of parallel submissions don't interleave
        {
            let mut out = out.lock();
            writeln!(out, "Submitting new task {:?}", config.request_name())?;
            writeln!(out, "\tDataset: {dataset}")?;
        }

        // written first so a failed submission can be retried by hand
        let path = config.write_rendered(&self.config_dir)?;

        match self.client {
            Some(client) => {
                client.submit(&path)?;

                let task_dir = config.task_dir();
                fs::create_dir_all(&task_dir).map_err(|source| SubmitError::Io {
                    path: task_dir.clone(),
                    source,
                })?;
                config.save_request(&task_dir)?;

                info!(task = %config.request_name(), "Submitted task");
            }
            None => writeln!(
                out.lock(),
                "Configuration file saved as {:?}",
                config.config_file_name()
            )?,
        }

        Ok(())
    }

    /// Handle every dataset of `catalogue` on `workers` threads, returns the number of failures
    pub fn run<W: Write + Send>(
        &self,
        out: &Mutex<W>,
        catalogue: &Catalogue,
        workers: usize,
    ) -> Result<u64, SubmitError> {
        debug!("Starting thread pool with {workers} threads");

        let pool = ThreadPoolBuilder::new().num_threads(workers).build()?;

        // general counters to provide a progress report
        let total = catalogue.len() as u64;
        let processed = AtomicU64::new(0);
        let failed = AtomicU64::new(0);

        pool.install(|| {
            catalogue.par_iter().for_each(|(dataset, options)| {
                if let Err(e) = self.submit_one(out, dataset, options) {
                    error!(dataset = %dataset, task = %options.name, "Failed to handle dataset: {e}");
                    failed.fetch_add(1, Ordering::SeqCst);
                }

                info!(
                    "Done with {}/{}",
                    processed.fetch_add(1, Ordering::SeqCst) + 1,
                    total
                );
            })
        });

        let failed = failed.load(Ordering::SeqCst);
        if failed > 0 {
            warn!("{failed}/{total} datasets failed");
        } else {
            info!("Done with processing");
        }

        Ok(failed)
    }
}
