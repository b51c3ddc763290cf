//! Babysitting of the tasks of a work area.
//!
//! Every task is polled once, bucketed by the state the grid reports, and
//! the buckets are written to a production state file (`prod_<tag>.json`) so
//! that tasks already harvested into the database are not polled again.

use crate::{
    config::ConfigErrors,
    database::ConnectionError,
    grid::GridError,
    provenance::{analysis_dir, ProductionTag, Provenance, ProvenanceError},
    services::Services,
    task::{TaskConfig, TaskError, TASK_PREFIX},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    io::Write,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_STATE_FILE: &str = "prod_default.json";
const RESUBMIT_BLACKLIST: &str = "T2_UK_SGrid_RALPP,T1_US_FNAL";

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("No task to monitor in the {0:?} directory")]
    NoTasks(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to (de)serialize state file {path:?}: {source}")]
    State {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write the report: {0}")]
    Report(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error(transparent)]
    Task(#[from] TaskError),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "SUBMITFAILED")]
    SubmitFailed,
    #[serde(rename = "RESUBMITFAILED")]
    ResubmitFailed,
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "TORESUBMIT")]
    ToResubmit,
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "KILLED")]
    Killed,
    #[serde(rename = "HOLDING")]
    Holding,
    // harvested into the database
    #[serde(rename = "GRIDIN-INDB")]
    InDatabase,
}

impl TaskState {
    pub const ALL: [TaskState; 12] = [
        Self::Completed,
        Self::SubmitFailed,
        Self::ResubmitFailed,
        Self::New,
        Self::Submitted,
        Self::ToResubmit,
        Self::Unknown,
        Self::Queued,
        Self::Failed,
        Self::Killed,
        Self::Holding,
        Self::InDatabase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::SubmitFailed => "SUBMITFAILED",
            Self::ResubmitFailed => "RESUBMITFAILED",
            Self::New => "NEW",
            Self::Submitted => "SUBMITTED",
            Self::ToResubmit => "TORESUBMIT",
            Self::Unknown => "UNKNOWN",
            Self::Queued => "QUEUED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::Holding => "HOLDING",
            Self::InDatabase => "GRIDIN-INDB",
        }
    }

    /// Bucket of a status string reported by the grid
    pub fn from_status(status: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == status)
    }
}

/// task directory names per state, as stored in the state file
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Buckets(BTreeMap<TaskState, Vec<String>>);

impl Buckets {
    pub fn new() -> Self {
        Self(TaskState::ALL.into_iter().map(|state| (state, Vec::new())).collect())
    }

    pub fn load(path: &Path) -> Result<Self, MonitorError> {
        let content = fs::read_to_string(path).map_err(|source| MonitorError::Io {
            path: path.to_owned(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| MonitorError::State {
            path: path.to_owned(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), MonitorError> {
        let content = serde_json::to_string(self).map_err(|source| MonitorError::State {
            path: path.to_owned(),
            source,
        })?;

        fs::write(path, content).map_err(|source| MonitorError::Io {
            path: path.to_owned(),
            source,
        })
    }

    pub fn get(&self, state: TaskState) -> &[String] {
        self.0.get(&state).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, state: TaskState, task: &str) -> bool {
        self.get(state).iter().any(|name| name == task)
    }

    pub fn push(&mut self, state: TaskState, task: &str) {
        self.0.entry(state).or_default().push(task.to_owned());
    }
}

/// Directory names of the tasks in `work_area`, sorted
pub fn list_tasks(work_area: &Path) -> Result<Vec<String>, MonitorError> {
    let entries = fs::read_dir(work_area).map_err(|source| MonitorError::Io {
        path: work_area.to_owned(),
        source,
    })?;

    let mut tasks = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    tasks.sort();

    if tasks.is_empty() {
        return Err(MonitorError::NoTasks(work_area.to_owned()));
    }

    Ok(tasks)
}

/// The newest `prod_*.json` in `directory`, by status change time
pub fn newest_state_file(directory: &Path) -> Option<PathBuf> {
    fs::read_dir(directory)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("prod_") && name.ends_with(".json")
        })
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            Some(((metadata.ctime(), metadata.ctime_nsec()), entry.path()))
        })
        .max()
        .map(|(_, path)| path)
}

pub struct StatusOptions {
    // start monitoring a new production, named after the current code versions
    pub new: bool,
    pub state_file: PathBuf,
    // where state files are looked up
    pub directory: PathBuf,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            new: false,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            directory: PathBuf::from("."),
        }
    }
}

/// Pick the state file and the production tag it belongs to
pub fn choose_state_file(
    options: &StatusOptions,
    new_tag: Option<ProductionTag>,
) -> (PathBuf, Option<ProductionTag>) {
    if let Some(tag) = new_tag {
        return (options.directory.join(tag.state_file()), Some(tag));
    }

    let mut path = options.directory.join(&options.state_file);

    if options.state_file == Path::new(DEFAULT_STATE_FILE) {
        if let Some(newest) = newest_state_file(&options.directory) {
            path = newest;
        }
    }

    let tag = path
        .file_name()
        .and_then(|name| ProductionTag::parse_state_file(&name.to_string_lossy()));

    (path, tag)
}

fn sample_of_task(tag: &ProductionTag, task: &str) -> String {
    tag.sample_name(task.strip_prefix(TASK_PREFIX).unwrap_or(task))
}

/// Poll every task of the work area and update the state file
pub fn poll<W: Write>(
    out: &mut W,
    services: &Services,
    options: &StatusOptions,
) -> Result<(Buckets, usize), MonitorError> {
    let work_area = &services.config.submission.work_area;
    let tasks = list_tasks(work_area)?;

    let new_tag = if options.new {
        // all the tasks of a production share the analysis
        let request = TaskConfig::load_request(&work_area.join(&tasks[0]))?;
        writeln!(out, "##### Figure out the code(s) version").map_err(MonitorError::Report)?;

        let provenance = Provenance::resolve(
            services.versions,
            &services.config.framework.framework_dir()?,
            &analysis_dir(&request.job_type.pset_name),
        )?;
        let tag = provenance.tag();
        writeln!(out, "The output json will be: {}", tag.state_file()).map_err(MonitorError::Report)?;

        Some(tag)
    } else {
        None
    };

    let (state_file, tag) = choose_state_file(options, new_tag);
    info!(state_file = ?state_file, "Using production state file");

    let previous = if state_file.is_file() {
        let mut previous = Buckets::load(&state_file)?;

        if let Some(tag) = &tag {
            let harvested = previous
                .get(TaskState::Completed)
                .iter()
                .filter(|task| !previous.contains(TaskState::InDatabase, task))
                .map(|task| -> Result<Option<String>, ConnectionError> {
                    let sample = sample_of_task(tag, task);
                    Ok(services
                        .connection
                        .find_sample_by_name(&sample)?
                        .map(|_| task.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            for task in harvested.into_iter().flatten() {
                debug!(task = %task, "Task was harvested since the last poll");
                previous.push(TaskState::InDatabase, &task);
            }
        } else {
            warn!(state_file = ?state_file, "Unknown production tag, harvested tasks are not looked up");
        }

        Some(previous)
    } else {
        None
    };

    let mut buckets = Buckets::new();

    for task in &tasks {
        if previous
            .as_ref()
            .is_some_and(|previous| previous.contains(TaskState::InDatabase, task))
        {
            buckets.push(TaskState::InDatabase, task);
            continue;
        }

        let task_dir = work_area.join(task);
        writeln!(out, "\n##### {task} #####").map_err(MonitorError::Report)?;

        let state = match services.client.status(&task_dir) {
            Ok(status) => {
                let failed_jobs = status.jobs_per_status.get("failed").copied().unwrap_or(0);
                if failed_jobs > 0 {
                    TaskState::ToResubmit
                } else {
                    TaskState::from_status(&status.status).unwrap_or_else(|| {
                        warn!(task = %task, status = %status.status, "Unexpected task status");
                        TaskState::Unknown
                    })
                }
            }
            Err(GridError::MissingTaskCache { .. }) => {
                writeln!(
                    out,
                    "Something went wrong: directory {} was not properly created. Will count it as 'SUBMITFAILED'...",
                    task_dir.display()
                )
                .map_err(MonitorError::Report)?;
                TaskState::SubmitFailed
            }
            Err(e) => {
                error!(task = %task, "Failed to get the task status: {e}");
                TaskState::Unknown
            }
        };

        writeln!(out, "{}", state.as_str()).map_err(MonitorError::Report)?;
        buckets.push(state, task);
    }

    buckets.save(&state_file)?;

    Ok((buckets, tasks.len()))
}

/// Print the non-empty buckets and what to do with their tasks
pub fn print_summary<W: Write>(
    out: &mut W,
    buckets: &Buckets,
    total: usize,
    work_area: &Path,
) -> io::Result<()> {
    writeln!(out, "##### ##### Status summary ({total} tasks) ##### #####")?;
    for state in TaskState::ALL {
        let tasks = buckets.get(state);
        if !tasks.is_empty() {
            writeln!(out, "{}: {}", state.as_str(), tasks.len())?;
        }
    }

    writeln!(out, "##### ##### Suggested actions ##### #####")?;

    let suggestions: [(TaskState, &dyn Fn(&str) -> String); 4] = [
        (TaskState::Completed, &|task: &str| {
            format!("gridin harvest {}", work_area.join(task).display())
        }),
        (TaskState::SubmitFailed, &|task: &str| {
            format!("rm -r {}; crab submit {task}.py", work_area.join(task).display())
        }),
        (TaskState::Failed, &|task: &str| {
            format!("crab resubmit {}", work_area.join(task).display())
        }),
        (TaskState::ToResubmit, &|task: &str| {
            format!(
                "crab resubmit {} --siteblacklist={RESUBMIT_BLACKLIST}",
                work_area.join(task).display()
            )
        }),
    ];

    for (state, suggest) in suggestions {
        let tasks = buckets.get(state);
        if tasks.is_empty() {
            continue;
        }

        writeln!(out, "##### {} tasks #####", state.as_str())?;
        for task in tasks {
            writeln!(out, "{}", suggest(task.as_str()))?;
        }
    }

    Ok(())
}
