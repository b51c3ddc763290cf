mod crab;

pub use crab::CrabClient;

use crate::lumi::LumiMask;
use gridin_ingest::process::ProcessError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Display, path::Path};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Failed to run the grid client")]
    Process(#[from] ProcessError),
    #[error("Task directory {dir} was not properly created, the task cache is missing")]
    MissingTaskCache { dir: String },
    #[error("Transient failure of `{command}`: {stderr}")]
    Transient { command: String, stderr: String },
    #[error("`{command}` failed: {stderr}")]
    Failed { command: String, stderr: String },
    #[error("Output listing of {dir} has {lfn} logical but {pfn} physical file names")]
    MismatchedListing { dir: String, lfn: usize, pfn: usize },
    #[error("Failed to deserialize the answer of `{command}`: {source}")]
    Deserialize {
        command: String,
        source: serde_json::Error,
    },
}

impl GridError {
    /// Server hiccups and hanging clients are worth another attempt, nothing else is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Process(ProcessError::Timeout { .. })
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskStatus {
    pub status: String,
    #[serde(rename = "jobsPerStatus", default)]
    pub jobs_per_status: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TaskReport {
    #[serde(rename = "numEventsRead", default)]
    pub num_events_read: Option<u64>,
    #[serde(rename = "processedLumis", default)]
    pub processed_lumis: Option<LumiMask>,
}

/// Outputs of a task as stored on the grid, `lfn[i]` and `pfn[i]` describe the same file
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputListing {
    #[serde(default)]
    pub lfn: Vec<String>,
    #[serde(default)]
    pub pfn: Vec<String>,
}

impl OutputListing {
    pub fn len(&self) -> usize {
        self.lfn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lfn.is_empty()
    }

    /// Refuse listings where a file lacks its physical name
    pub fn checked(self, task_dir: &Path) -> Result<Self, GridError> {
        if self.lfn.len() != self.pfn.len() {
            return Err(GridError::MismatchedListing {
                dir: task_dir.display().to_string(),
                lfn: self.lfn.len(),
                pfn: self.pfn.len(),
            });
        }

        Ok(self)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lfn
            .iter()
            .zip(self.pfn.iter())
            .map(|(lfn, pfn)| (lfn.as_str(), pfn.as_str()))
    }
}

/// The operations of the grid scheduler client the tools rely on
pub trait GridClient: Send + Sync {
    fn submit(&self, config_file: &Path) -> Result<(), GridError>;
    fn status(&self, task_dir: &Path) -> Result<TaskStatus, GridError>;
    fn report(&self, task_dir: &Path) -> Result<TaskReport, GridError>;
    fn output_files(&self, task_dir: &Path) -> Result<OutputListing, GridError>;
}

/// Call `f` up to `attempts` times.
///
/// Errors accepted by `is_retryable` are swallowed for all but the last attempt,
/// any other error is returned immediately. The last attempt is returned as is.
pub fn retry<T, E, F, R>(attempts: usize, is_retryable: R, mut f: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    for attempt in 1..attempts {
        match f() {
            Err(error) if is_retryable(&error) => {
                warn!(attempt = attempt, attempts = attempts, "Trying again after: {error}");
            }
            result => return result,
        }
    }

    f()
}

/// Retries the read-only queries of `C`, submission goes through once
#[derive(Debug, Clone)]
pub struct Retrying<C> {
    inner: C,
    attempts: usize,
}

impl<C: GridClient> Retrying<C> {
    pub fn new(inner: C, attempts: usize) -> Self {
        Self { inner, attempts }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: GridClient> GridClient for Retrying<C> {
    fn submit(&self, config_file: &Path) -> Result<(), GridError> {
        self.inner.submit(config_file)
    }

    fn status(&self, task_dir: &Path) -> Result<TaskStatus, GridError> {
        retry(self.attempts, GridError::is_retryable, || self.inner.status(task_dir))
    }

    fn report(&self, task_dir: &Path) -> Result<TaskReport, GridError> {
        retry(self.attempts, GridError::is_retryable, || self.inner.report(task_dir))
    }

    fn output_files(&self, task_dir: &Path) -> Result<OutputListing, GridError> {
        retry(self.attempts, GridError::is_retryable, || {
            self.inner.output_files(task_dir)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transient() -> GridError {
        GridError::Transient {
            command: "status".to_owned(),
            stderr: "HTTPException".to_owned(),
        }
    }

    #[test]
    fn retry_returns_first_success() {
        let calls = Cell::new(0);
        let result: Result<u32, GridError> = retry(5, GridError::is_retryable, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(transient())
            } else {
                Ok(7)
            }
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), GridError> = retry(5, GridError::is_retryable, || {
            calls.set(calls.get() + 1);
            Err(transient())
        });

        assert!(matches!(result, Err(GridError::Transient { .. })));
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn listing_without_physical_names_is_refused() {
        let listing: OutputListing =
            serde_json::from_str(r#"{"lfn": ["/store/user/me/TT/output_mc_1.root"]}"#).unwrap();

        assert!(matches!(
            listing.checked(Path::new("tasks/crab_TT")),
            Err(GridError::MismatchedListing { lfn: 1, pfn: 0, .. })
        ));

        let listing = OutputListing {
            lfn: vec!["/store/a.root".to_owned()],
            pfn: vec!["srm://se/store/a.root".to_owned()],
        };
        assert_eq!(listing.clone().checked(Path::new("tasks/crab_TT")).unwrap(), listing);
    }

    #[test]
    fn retry_propagates_other_errors_at_once() {
        let calls = Cell::new(0);
        let result: Result<(), GridError> = retry(5, GridError::is_retryable, || {
            calls.set(calls.get() + 1);
            Err(GridError::MissingTaskCache {
                dir: "tasks/crab_a".to_owned(),
            })
        });

        assert!(matches!(result, Err(GridError::MissingTaskCache { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn single_attempt_is_returned_as_is() {
        let calls = Cell::new(0);
        let result: Result<(), GridError> = retry(1, GridError::is_retryable, || {
            calls.set(calls.get() + 1);
            Err(transient())
        });

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    struct Flaky {
        calls: AtomicUsize,
    }

    impl GridClient for Flaky {
        fn submit(&self, _: &Path) -> Result<(), GridError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        }

        fn status(&self, _: &Path) -> Result<TaskStatus, GridError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(transient())
            } else {
                Ok(TaskStatus {
                    status: "COMPLETED".to_owned(),
                    jobs_per_status: BTreeMap::new(),
                })
            }
        }

        fn report(&self, _: &Path) -> Result<TaskReport, GridError> {
            Ok(TaskReport::default())
        }

        fn output_files(&self, _: &Path) -> Result<OutputListing, GridError> {
            Ok(OutputListing::default())
        }
    }

    #[test]
    fn wrapper_retries_queries_only() {
        let client = Retrying::new(
            Flaky {
                calls: AtomicUsize::new(0),
            },
            5,
        );

        assert_eq!(client.status(Path::new("tasks/a")).unwrap().status, "COMPLETED");
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 2);

        assert!(client.submit(Path::new("crab_a.py")).is_err());
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn report_without_event_count() {
        let report: TaskReport = serde_json::from_str(r#"{"processedLumis": {"1": [[1, 2]]}}"#).unwrap();

        assert_eq!(report.num_events_read, None);
        assert!(report.processed_lumis.is_some());
    }

    #[test]
    fn listing_pairs_lfn_and_pfn() {
        let listing: OutputListing = serde_json::from_str(
            r#"{"lfn": ["/store/a_1.root", "/store/a_2.root"], "pfn": ["srm://se/a_1.root", "srm://se/a_2.root"]}"#,
        )
        .unwrap();

        assert_eq!(listing.len(), 2);
        assert_eq!(
            listing.files().nth(1),
            Some(("/store/a_2.root", "srm://se/a_2.root"))
        );
    }
}
