use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_owned()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Failed to read file or its metadata")]
    Io(#[from] Error),
    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Configuration contains errors, see the log above")]
    Preflight,
    #[error("CMSSW_BASE is neither configured nor set in the environment")]
    MissingCmsswBase,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields, default)]
pub struct GridConfig {
    #[serde(alias = "db")]
    pub database: DatabaseConfig,
    // grid scheduler client, see grid::CrabClient for the calling convention
    pub grid: ClientConfig,
    // ROOT reader used to inspect framework outputs
    pub inspector: InspectorConfig,
    // dataset importer used when a dataset is not catalogued yet
    pub importer: ImporterConfig,
    pub submission: SubmissionConfig,
    pub storage: StorageConfig,
    pub framework: FrameworkConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct ClientConfig {
    pub exec: PathBuf,
    // passed before the command, e.g. the wrapper script when exec is an interpreter
    pub params: Vec<String>,
    // attempts for status/report/getoutput before giving up
    pub attempts: usize,
    // seconds
    pub timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            exec: PathBuf::from("crab-json"),
            params: Vec::new(),
            attempts: 5,
            timeout: 600,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct InspectorConfig {
    pub exec: PathBuf,
    pub params: Vec<String>,
    // milliseconds
    pub timeout: u64,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            exec: PathBuf::from("gridin-inspect"),
            params: Vec::new(),
            timeout: 60_000,
        }
    }
}

impl InspectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct ImporterConfig {
    pub exec: PathBuf,
    // seconds
    pub timeout: u64,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            exec: PathBuf::from("das-import"),
            timeout: 300,
        }
    }
}

impl ImporterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct SubmissionConfig {
    pub work_area: PathBuf,
    pub storage_site: String,
    pub workers: usize,
    // grid (storage) user name, falls back to the owner of the working directory
    pub username: Option<String>,
    pub default_lumi_mask: String,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            work_area: PathBuf::from("tasks"),
            storage_site: "T2_BE_UCL".to_owned(),
            workers: 4,
            username: None,
            default_lumi_mask: "https://cms-service-dqm.web.cern.ch/cms-service-dqm/CAF/certification/Collisions15/13TeV/Cert_246908-247381_13TeV_PromptReco_Collisions15_ZeroTesla_JSON.txt".to_owned(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub local_prefix: String,
    pub remote_prefix: String,
    // host names containing this marker read outputs through `local_prefix`
    pub local_host_marker: String,
    pub user_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_prefix: "/storage/data/cms".to_owned(),
            remote_prefix: "root://cms-xrd-global.cern.ch/".to_owned(),
            local_host_marker: "ingrid".to_owned(),
            user_root: PathBuf::from("/storage/data/cms/store/user"),
        }
    }
}

impl StorageConfig {
    pub fn prefix_for_host(&self, hostname: &str) -> &str {
        if hostname.contains(&self.local_host_marker) {
            &self.local_prefix
        } else {
            &self.remote_prefix
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct FrameworkConfig {
    pub cmssw_base: Option<PathBuf>,
    // relative to cmssw_base
    pub package: PathBuf,
    // relative to package
    pub framework: PathBuf,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            cmssw_base: None,
            package: PathBuf::from("src/cp3_llbb"),
            framework: PathBuf::from("Framework"),
        }
    }
}

impl FrameworkConfig {
    pub fn cmssw_base(&self) -> Result<PathBuf, ConfigErrors> {
        match &self.cmssw_base {
            Some(base) => Ok(base.clone()),
            None => env::var_os("CMSSW_BASE")
                .map(PathBuf::from)
                .ok_or(ConfigErrors::MissingCmsswBase),
        }
    }

    /// root of the analysis package tree, searched for parameter sets
    pub fn package_dir(&self) -> Result<PathBuf, ConfigErrors> {
        Ok(self.cmssw_base()?.join(&self.package))
    }

    /// checkout of the framework, used for provenance
    pub fn framework_dir(&self) -> Result<PathBuf, ConfigErrors> {
        Ok(self.package_dir()?.join(&self.framework))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct CleanupConfig {
    // productions that must never be deleted
    pub whitelist: PathBuf,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            whitelist: PathBuf::from("data/SAMADhi_doNOTdelete_whitelist.json"),
        }
    }
}

impl GridConfig {
    /// Load the configuration at `path`, falling back to defaults if it doesn't exist
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.exists() {
            info!(path = ?path, "No configuration file found, using defaults");

            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;

        serde_yaml::from_str(&content).map_err(|source| ConfigErrors::Parse {
            path: path.to_owned(),
            source,
        })
    }

    // executables given as bare names are resolved through PATH at call time
    fn check_tool(section: &str, exec: &Path) -> bool {
        if exec.components().count() <= 1 {
            return false;
        }

        match check_executable(exec) {
            Ok(true) => false,
            Ok(false) => {
                error!("{section}.exec ({}) is not executable", exec.to_string_lossy());
                true
            }
            Err(e) => {
                error!(
                    "Failed to determine if {section}.exec ({}) is an executable: {e}",
                    exec.to_string_lossy()
                );
                true
            }
        }
    }

    /// Log every problem of the configuration, returns true if any of them is fatal
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.grid.attempts == 0 {
            error!("grid.attempts cannot be 0, at least one call to the grid client is needed");
            contains_error = true;
        }

        if self.grid.timeout == 0 || self.importer.timeout == 0 || self.inspector.timeout == 0 {
            error!("Timeouts cannot be 0");
            contains_error = true;
        }

        if self.submission.workers == 0 {
            error!("submission.workers cannot be 0");
            contains_error = true;
        }

        if self.submission.storage_site.is_empty() {
            error!("submission.storage_site cannot be empty");
            contains_error = true;
        }

        if self.storage.local_host_marker.is_empty() {
            warn!("storage.local_host_marker is empty, every host will read outputs locally");
        }

        contains_error |= Self::check_tool("grid", &self.grid.exec);
        contains_error |= Self::check_tool("inspector", &self.inspector.exec);
        contains_error |= Self::check_tool("importer", &self.importer.exec);

        contains_error
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("gridin.db")
}
