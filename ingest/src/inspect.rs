use crate::{
    process::{run_captured, ProcessError},
    weights::WeightSums,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    ffi::OsString,
    path::Path,
    process::Command,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error};

/// name of the nominal sum of event weights stored in every framework output
pub const NOMINAL_WEIGHT_SUM: &str = "event_weight_sum";
/// prefix of the additional (systematic) sums of event weights
pub const EXTRA_WEIGHT_SUM_PREFIX: &str = "event_weight_sum_";

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("The output file {path:?} is missing on the disk. You need to relaunch the associated job.")]
    Missing { path: String },
    #[error("Output file {path:?} is corrupted. {what} is missing.")]
    Corrupted { path: String, what: &'static str },
    #[error("Failed to run the output reader")]
    Process(#[from] ProcessError),
    #[error("The output reader failed on {path:?}: {stderr}")]
    ReaderFailed { path: String, stderr: String },
    #[error("Failed to deserialize output reader result")]
    Deserialize(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Bookkeeping numbers of a single framework output file
pub struct FileSummary {
    pub event_weight_sum: f64,
    pub extras_event_weight_sum: WeightSums,
    pub entries: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
/// What the output reader prints: every named scalar object of the file and
/// the entry count of the framework tree (absent when the tree is missing)
pub struct ReaderOutput {
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub entries: Option<u64>,
}

impl FileSummary {
    pub fn from_reader(path: &str, output: ReaderOutput) -> Result<Self, InspectError> {
        let event_weight_sum = output
            .values
            .get(NOMINAL_WEIGHT_SUM)
            .copied()
            .ok_or_else(|| InspectError::Corrupted {
                path: path.to_owned(),
                what: "\"event_weight_sum\"",
            })?;

        let extras_event_weight_sum = output
            .values
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(EXTRA_WEIGHT_SUM_PREFIX)
                    .map(|suffix| (suffix.to_owned(), *value))
            })
            .collect();

        let entries = output.entries.ok_or_else(|| InspectError::Corrupted {
            path: path.to_owned(),
            what: "Tree",
        })?;

        Ok(Self {
            event_weight_sum,
            extras_event_weight_sum,
            entries,
        })
    }
}

/// Reads the bookkeeping numbers out of a framework output file
pub trait OutputInspector: Send + Sync {
    fn inspect(&self, path: &str) -> Result<FileSummary, InspectError>;
}

/// remote urls (root://, srm://, ...) can't be checked for existence locally
pub fn is_local(path: &str) -> bool {
    !path.contains("://")
}

#[derive(Debug, Clone)]
/// Inspector delegating to an external ROOT reader executable
pub struct ExecInspector {
    pub exec: OsString,
    pub params: Vec<String>,
    pub timeout: Duration,
}

impl ExecInspector {
    pub fn new(exec: impl Into<OsString>, params: Vec<String>, timeout: Duration) -> Self {
        Self {
            exec: exec.into(),
            params,
            timeout,
        }
    }
}

impl OutputInspector for ExecInspector {
    #[tracing::instrument(level = "debug", skip(self))]
    fn inspect(&self, path: &str) -> Result<FileSummary, InspectError> {
        if is_local(path) && !Path::new(path).is_file() {
            return Err(InspectError::Missing {
                path: path.to_owned(),
            });
        }

        let output = run_captured(
            Command::new(&self.exec).args(&self.params).arg(path),
            self.timeout,
        )?;

        if !output.success() {
            debug!(stderr = %output.stderr, "Output reader failed");

            return Err(InspectError::ReaderFailed {
                path: path.to_owned(),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        match serde_yaml::from_str::<ReaderOutput>(&output.stdout) {
            Ok(reader_output) => FileSummary::from_reader(path, reader_output),
            Err(e) => {
                error!("Output reader printed something unreadable: {e}");

                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};

    fn reader(values: &[(&str, f64)], entries: Option<u64>) -> ReaderOutput {
        ReaderOutput {
            values: values
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            entries,
        }
    }

    #[test]
    fn splits_nominal_and_extra_sums() {
        let summary = FileSummary::from_reader(
            "output_1.root",
            reader(
                &[
                    ("event_weight_sum", 10.5),
                    ("event_weight_sum_scale_up", 11.0),
                    ("event_weight_sum_scale_down", 9.0),
                    ("cutflow", 3.0),
                ],
                Some(42),
            ),
        )
        .unwrap();

        assert_eq!(summary.event_weight_sum, 10.5);
        assert_eq!(summary.entries, 42);
        assert_eq!(
            summary.extras_event_weight_sum,
            WeightSums::from([("scale_down".into(), 9.0), ("scale_up".into(), 11.0)])
        );
    }

    #[test]
    fn missing_nominal_sum_is_corruption() {
        let error = FileSummary::from_reader("f.root", reader(&[], Some(1))).unwrap_err();

        assert!(error.to_string().contains("\"event_weight_sum\" is missing"));
    }

    #[test]
    fn missing_tree_is_corruption() {
        let error =
            FileSummary::from_reader("f.root", reader(&[("event_weight_sum", 1.0)], None))
                .unwrap_err();

        assert!(error.to_string().contains("Tree is missing"));
    }

    #[test]
    fn missing_local_file_is_reported_before_spawning() {
        let inspector = ExecInspector::new("/nonexistent", vec![], Duration::from_secs(1));
        let error = inspector.inspect("/does/not/exist.root").unwrap_err();

        assert!(matches!(error, InspectError::Missing { .. }));
    }

    #[test]
    fn runs_reader_and_parses_its_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("reader.sh");
        fs::write(
            &script,
            "#!/bin/sh\necho 'values: {event_weight_sum: 2.5, event_weight_sum_pdf: 3.5}'\necho 'entries: 7'\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let output = dir.path().join("output.root");
        fs::write(&output, b"").unwrap();

        let inspector = ExecInspector::new(&script, vec![], Duration::from_secs(10));
        let summary = inspector.inspect(output.to_str().unwrap()).unwrap();

        assert_eq!(summary.event_weight_sum, 2.5);
        assert_eq!(summary.entries, 7);
        assert_eq!(summary.extras_event_weight_sum.get("pdf"), Some(&3.5));
    }
}
