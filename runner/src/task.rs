//! Grid task configuration.
//!
//! A [`TaskConfig`] mirrors the sections of the grid client's configuration
//! (General, JobType, Data, Site). It is rendered to the client's Python
//! configuration syntax (`crab_<name>.py`), parsed back from such files, and
//! cached as JSON inside the task directory once the task is submitted.

mod pyvalue;

pub use pyvalue::PyValue;

use crate::datasets::DatasetOptions;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// file inside a task directory holding the configuration the task was submitted with
pub const REQUEST_CACHE: &str = "gridin-request.json";
/// prefix the grid client puts in front of request names for task directories
pub const TASK_PREFIX: &str = "crab_";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("I/O error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to (de)serialize request cache {path:?}: {source}")]
    Cache {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("config.{section}.{key} is missing")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("config.{section}.{key} has an unexpected value {value}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
    #[error("Dataset {dataset} is data but has no run_range")]
    MissingRunRange { dataset: String },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Splitting {
    FileBased,
    LumiBased,
}

impl Splitting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileBased => "FileBased",
            Self::LumiBased => "LumiBased",
        }
    }

    /// data is split by luminosity sections, simulation by files
    pub fn is_data(&self) -> bool {
        matches!(self, Self::LumiBased)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct General {
    pub request_name: String,
    pub work_area: PathBuf,
    pub transfer_outputs: bool,
    pub transfer_logs: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobType {
    pub plugin_name: String,
    pub pset_name: PathBuf,
    pub disable_automatic_output_collection: bool,
    pub output_files: Vec<String>,
    #[serde(rename = "allowUndistributedCMSSW")]
    pub allow_undistributed_cmssw: bool,
    pub send_external_folder: bool,
    pub py_cfg_params: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    pub input_dataset: String,
    #[serde(rename = "inputDBS")]
    pub input_dbs: String,
    pub allow_non_valid_input_dataset: bool,
    pub splitting: Splitting,
    pub units_per_job: u32,
    #[serde(rename = "outLFNDirBase")]
    pub out_lfn_dir_base: String,
    pub publication: bool,
    pub publish_data_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lumi_mask: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub storage_site: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskConfig {
    #[serde(rename = "General")]
    pub general: General,
    #[serde(rename = "JobType")]
    pub job_type: JobType,
    #[serde(rename = "Data")]
    pub data: Data,
    #[serde(rename = "Site")]
    pub site: Site,
}

/// Everything of a task configuration that doesn't depend on the dataset
#[derive(Clone, Debug)]
pub struct TaskDefaults {
    pub is_mc: bool,
    pub work_area: PathBuf,
    pub storage_site: String,
    pub username: String,
    pub default_lumi_mask: String,
}

impl TaskConfig {
    /// Configuration shared by every task of a submission
    pub fn with_defaults(defaults: &TaskDefaults) -> Self {
        Self {
            general: General {
                request_name: String::new(),
                work_area: defaults.work_area.clone(),
                transfer_outputs: true,
                transfer_logs: true,
            },
            job_type: JobType {
                plugin_name: "Analysis".to_owned(),
                pset_name: PathBuf::new(),
                disable_automatic_output_collection: true,
                output_files: Vec::new(),
                allow_undistributed_cmssw: true,
                // electron MVA ids travel with the jobs
                send_external_folder: true,
                py_cfg_params: Vec::new(),
            },
            data: Data {
                input_dataset: String::new(),
                input_dbs: "global".to_owned(),
                allow_non_valid_input_dataset: true,
                splitting: if defaults.is_mc {
                    Splitting::FileBased
                } else {
                    Splitting::LumiBased
                },
                units_per_job: 1,
                out_lfn_dir_base: format!("/store/user/{}/", defaults.username),
                publication: false,
                publish_data_name: String::new(),
                run_range: None,
                lumi_mask: None,
            },
            site: Site {
                storage_site: defaults.storage_site.clone(),
            },
        }
    }

    /// Specialize the shared configuration for one dataset
    pub fn for_dataset(
        defaults: &TaskDefaults,
        pset: &Path,
        output_file: &str,
        dataset: &str,
        options: &DatasetOptions,
    ) -> Result<Self, TaskError> {
        let mut config = Self::with_defaults(defaults);

        config.job_type.pset_name = pset.to_owned();
        config.job_type.output_files.push(output_file.to_owned());

        config.general.request_name = options.name.clone();
        config.data.publish_data_name = options.name.clone();
        config.data.input_dataset = dataset.to_owned();
        config.data.units_per_job = options.units_per_job;

        let params = &mut config.job_type.py_cfg_params;
        params.push(format!("era={}", options.era));
        if let Some(global_tag) = &options.global_tag {
            params.push(format!("globalTag={global_tag}"));
        }

        if !defaults.is_mc {
            // PromptReco is produced by the RECO process instead of PAT
            if dataset.contains("PromptReco") {
                params.push("process=RECO".to_owned());
            }

            let (first, last) = options.run_range.ok_or_else(|| TaskError::MissingRunRange {
                dataset: dataset.to_owned(),
            })?;
            config.data.run_range = Some(format!("{first}-{last}"));
            config.data.lumi_mask = Some(
                options
                    .certified_lumi_file
                    .clone()
                    .unwrap_or_else(|| defaults.default_lumi_mask.clone()),
            );
        }

        Ok(config)
    }

    pub fn request_name(&self) -> &str {
        &self.general.request_name
    }

    pub fn is_data(&self) -> bool {
        self.data.splitting.is_data()
    }

    /// file the rendered configuration is written to
    pub fn config_file_name(&self) -> String {
        format!("{TASK_PREFIX}{}.py", self.general.request_name)
    }

    /// directory the grid client creates for the task
    pub fn task_dir(&self) -> PathBuf {
        self.general
            .work_area
            .join(format!("{TASK_PREFIX}{}", self.general.request_name))
    }

    fn entries(&self) -> Vec<(&'static str, &'static str, PyValue)> {
        let strings = |values: &[String]| PyValue::List(values.iter().map(PyValue::from).collect());
        let path = |path: &Path| PyValue::Str(path.to_string_lossy().into_owned());

        let mut entries = vec![
            ("General", "requestName", PyValue::from(&self.general.request_name)),
            ("General", "workArea", path(&self.general.work_area)),
            ("General", "transferOutputs", PyValue::Bool(self.general.transfer_outputs)),
            ("General", "transferLogs", PyValue::Bool(self.general.transfer_logs)),
            ("JobType", "pluginName", PyValue::from(&self.job_type.plugin_name)),
            ("JobType", "psetName", path(&self.job_type.pset_name)),
            (
                "JobType",
                "disableAutomaticOutputCollection",
                PyValue::Bool(self.job_type.disable_automatic_output_collection),
            ),
            ("JobType", "outputFiles", strings(&self.job_type.output_files)),
            (
                "JobType",
                "allowUndistributedCMSSW",
                PyValue::Bool(self.job_type.allow_undistributed_cmssw),
            ),
            ("JobType", "sendExternalFolder", PyValue::Bool(self.job_type.send_external_folder)),
            ("JobType", "pyCfgParams", strings(&self.job_type.py_cfg_params)),
            ("Data", "inputDataset", PyValue::from(&self.data.input_dataset)),
            ("Data", "inputDBS", PyValue::from(&self.data.input_dbs)),
            (
                "Data",
                "allowNonValidInputDataset",
                PyValue::Bool(self.data.allow_non_valid_input_dataset),
            ),
            ("Data", "splitting", PyValue::Str(self.data.splitting.as_str().to_owned())),
            ("Data", "unitsPerJob", PyValue::Int(i64::from(self.data.units_per_job))),
            ("Data", "outLFNDirBase", PyValue::from(&self.data.out_lfn_dir_base)),
            ("Data", "publication", PyValue::Bool(self.data.publication)),
            ("Data", "publishDataName", PyValue::from(&self.data.publish_data_name)),
        ];

        if let Some(run_range) = &self.data.run_range {
            entries.push(("Data", "runRange", PyValue::from(run_range)));
        }
        if let Some(lumi_mask) = &self.data.lumi_mask {
            entries.push(("Data", "lumiMask", PyValue::from(lumi_mask)));
        }

        entries.push(("Site", "storageSite", PyValue::from(&self.site.storage_site)));

        entries
    }

    /// Render in the grid client's configuration syntax
    pub fn render(&self) -> String {
        let mut rendered = String::from(
            "from WMCore.Configuration import Configuration\nconfig = Configuration()\n",
        );
        let mut current_section = "";

        for (section, key, value) in self.entries() {
            if section != current_section {
                let _ = write!(rendered, "\nconfig.section_('{section}')\n");
                current_section = section;
            }
            let _ = writeln!(rendered, "config.{section}.{key} = {value}");
        }

        rendered
    }

    /// Rebuild a configuration from its rendered form
    pub fn from_rendered(text: &str) -> Result<Self, TaskError> {
        let assignments = parse_assignments(text)?;
        let lookup = Lookup(&assignments);

        let splitting = match lookup.string("Data", "splitting", Some("FileBased"))?.as_str() {
            "FileBased" => Splitting::FileBased,
            "LumiBased" => Splitting::LumiBased,
            other => {
                return Err(TaskError::InvalidValue {
                    section: "Data",
                    key: "splitting",
                    value: other.to_owned(),
                })
            }
        };

        Ok(Self {
            general: General {
                request_name: lookup.string("General", "requestName", None)?,
                work_area: PathBuf::from(lookup.string("General", "workArea", Some("tasks"))?),
                transfer_outputs: lookup.boolean("General", "transferOutputs", true)?,
                transfer_logs: lookup.boolean("General", "transferLogs", true)?,
            },
            job_type: JobType {
                plugin_name: lookup.string("JobType", "pluginName", Some("Analysis"))?,
                pset_name: PathBuf::from(lookup.string("JobType", "psetName", None)?),
                disable_automatic_output_collection: lookup.boolean(
                    "JobType",
                    "disableAutomaticOutputCollection",
                    false,
                )?,
                output_files: lookup.strings("JobType", "outputFiles")?,
                allow_undistributed_cmssw: lookup.boolean(
                    "JobType",
                    "allowUndistributedCMSSW",
                    false,
                )?,
                send_external_folder: lookup.boolean("JobType", "sendExternalFolder", false)?,
                py_cfg_params: lookup.strings("JobType", "pyCfgParams")?,
            },
            data: Data {
                input_dataset: lookup.string("Data", "inputDataset", None)?,
                input_dbs: lookup.string("Data", "inputDBS", Some("global"))?,
                allow_non_valid_input_dataset: lookup.boolean(
                    "Data",
                    "allowNonValidInputDataset",
                    false,
                )?,
                splitting,
                units_per_job: lookup.integer("Data", "unitsPerJob", 1)?,
                out_lfn_dir_base: lookup.string("Data", "outLFNDirBase", Some(""))?,
                publication: lookup.boolean("Data", "publication", false)?,
                publish_data_name: lookup.string("Data", "publishDataName", Some(""))?,
                run_range: lookup.optional_string("Data", "runRange")?,
                lumi_mask: lookup.optional_string("Data", "lumiMask")?,
            },
            site: Site {
                storage_site: lookup.string("Site", "storageSite", Some(""))?,
            },
        })
    }

    pub fn load_rendered(path: &Path) -> Result<Self, TaskError> {
        let text = fs::read_to_string(path).map_err(|source| TaskError::Io {
            path: path.to_owned(),
            source,
        })?;

        Self::from_rendered(&text)
    }

    /// Write the rendered configuration to `directory/crab_<name>.py`
    pub fn write_rendered(&self, directory: &Path) -> Result<PathBuf, TaskError> {
        let path = directory.join(self.config_file_name());
        fs::write(&path, self.render()).map_err(|source| TaskError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = ?path, "Wrote task configuration");

        Ok(path)
    }

    /// Store the configuration inside the task directory
    pub fn save_request(&self, task_dir: &Path) -> Result<(), TaskError> {
        let path = task_dir.join(REQUEST_CACHE);
        let content = serde_json::to_string_pretty(self).map_err(|source| TaskError::Cache {
            path: path.clone(),
            source,
        })?;

        fs::write(&path, content).map_err(|source| TaskError::Io { path, source })
    }

    /// Configuration a task directory was submitted with
    pub fn load_request(task_dir: &Path) -> Result<Self, TaskError> {
        let path = task_dir.join(REQUEST_CACHE);
        let content = fs::read_to_string(&path).map_err(|source| TaskError::Io {
            path: path.clone(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| TaskError::Cache { path, source })
    }
}

type Assignments = BTreeMap<(String, String), PyValue>;

fn parse_assignments(text: &str) -> Result<Assignments, TaskError> {
    let mut assignments = Assignments::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("config.") else {
            continue;
        };
        let Some((target, value)) = rest.split_once('=') else {
            // section declarations and other calls
            continue;
        };
        let Some((section, key)) = target.trim().split_once('.') else {
            continue;
        };

        let value = PyValue::parse(value.trim()).map_err(|message| TaskError::Syntax {
            line: index + 1,
            message,
        })?;

        assignments.insert((section.to_owned(), key.to_owned()), value);
    }

    Ok(assignments)
}

struct Lookup<'a>(&'a Assignments);

impl Lookup<'_> {
    fn get(&self, section: &'static str, key: &'static str) -> Option<&PyValue> {
        self.0.get(&(section.to_owned(), key.to_owned()))
    }

    fn invalid(section: &'static str, key: &'static str, value: &PyValue) -> TaskError {
        TaskError::InvalidValue {
            section,
            key,
            value: value.to_string(),
        }
    }

    fn optional_string(
        &self,
        section: &'static str,
        key: &'static str,
    ) -> Result<Option<String>, TaskError> {
        match self.get(section, key) {
            None => Ok(None),
            Some(PyValue::Str(value)) => Ok(Some(value.clone())),
            Some(other) => Err(Self::invalid(section, key, other)),
        }
    }

    fn string(
        &self,
        section: &'static str,
        key: &'static str,
        default: Option<&str>,
    ) -> Result<String, TaskError> {
        match (self.optional_string(section, key)?, default) {
            (Some(value), _) => Ok(value),
            (None, Some(default)) => Ok(default.to_owned()),
            (None, None) => Err(TaskError::MissingKey { section, key }),
        }
    }

    fn boolean(&self, section: &'static str, key: &'static str, default: bool) -> Result<bool, TaskError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(PyValue::Bool(value)) => Ok(*value),
            Some(other) => Err(Self::invalid(section, key, other)),
        }
    }

    fn integer(&self, section: &'static str, key: &'static str, default: u32) -> Result<u32, TaskError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(PyValue::Int(value)) => {
                u32::try_from(*value).map_err(|_| Self::invalid(section, key, &PyValue::Int(*value)))
            }
            Some(other) => Err(Self::invalid(section, key, other)),
        }
    }

    fn strings(&self, section: &'static str, key: &'static str) -> Result<Vec<String>, TaskError> {
        match self.get(section, key) {
            None => Ok(Vec::new()),
            Some(PyValue::List(values)) => values
                .iter()
                .map(|value| match value {
                    PyValue::Str(value) => Ok(value.clone()),
                    other => Err(Self::invalid(section, key, other)),
                })
                .collect(),
            Some(other) => Err(Self::invalid(section, key, other)),
        }
    }
}
