#![allow(dead_code)]

use gridin_ingest::{FileSummary, InspectError, OutputInspector, WeightSums};
use gridin_runner::{
    config::GridConfig,
    database::{NewDataset, SharedConnection},
    datasets::{DatasetOptions, Era},
    grid::{GridClient, GridError, OutputListing, TaskReport, TaskStatus},
    importer::{DatasetImporter, ImportError},
    provenance::{CodeVersion, ProvenanceError, VersionSource},
    services::Services,
    task::{TaskConfig, TaskDefaults},
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

pub const FRAMEWORK_HASH: &str = "f2f0a44";
pub const ANALYSIS_HASH: &str = "1234567";
pub const TAG: &str = "f2f0a44_TTAnalysis_1234567";

/// Grid answers keyed by task directory name
#[derive(Default)]
pub struct MockClient {
    pub statuses: BTreeMap<String, Result<TaskStatus, String>>,
    pub reports: BTreeMap<String, TaskReport>,
    pub listings: BTreeMap<String, OutputListing>,
    pub queried: Mutex<Vec<String>>,
}

fn task_name(task_dir: &Path) -> String {
    task_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

impl GridClient for MockClient {
    fn submit(&self, _: &Path) -> Result<(), GridError> {
        unreachable!("nothing is submitted in these tests")
    }

    fn status(&self, task_dir: &Path) -> Result<TaskStatus, GridError> {
        let name = task_name(task_dir);
        self.queried.lock().unwrap().push(name.clone());

        match self.statuses.get(&name) {
            Some(Ok(status)) => Ok(status.clone()),
            Some(Err(stderr)) if stderr.contains("CachefileNotFound") => {
                Err(GridError::MissingTaskCache {
                    dir: task_dir.display().to_string(),
                })
            }
            Some(Err(stderr)) => Err(GridError::Failed {
                command: "status".to_owned(),
                stderr: stderr.clone(),
            }),
            None => panic!("unexpected status query for {name}"),
        }
    }

    fn report(&self, task_dir: &Path) -> Result<TaskReport, GridError> {
        Ok(self
            .reports
            .get(&task_name(task_dir))
            .cloned()
            .unwrap_or_default())
    }

    fn output_files(&self, task_dir: &Path) -> Result<OutputListing, GridError> {
        Ok(self
            .listings
            .get(&task_name(task_dir))
            .cloned()
            .unwrap_or_default())
    }
}

/// File summaries keyed by full path, unknown files are missing
#[derive(Default)]
pub struct MockInspector {
    pub files: BTreeMap<String, FileSummary>,
}

impl OutputInspector for MockInspector {
    fn inspect(&self, path: &str) -> Result<FileSummary, InspectError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| InspectError::Missing {
                path: path.to_owned(),
            })
    }
}

#[derive(Default)]
pub struct MockImporter {
    pub datasets: BTreeMap<String, NewDataset>,
}

impl DatasetImporter for MockImporter {
    fn describe(&self, dataset: &str) -> Result<NewDataset, ImportError> {
        self.datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| ImportError::Failed {
                dataset: dataset.to_owned(),
                stderr: "No such dataset".to_owned(),
            })
    }
}

/// The framework lives in a directory named `Framework`, everything else is the analysis
pub struct FixedVersions;

impl VersionSource for FixedVersions {
    fn code_version(&self, directory: &Path) -> Result<CodeVersion, ProvenanceError> {
        let (owner, repo, hash) = if directory.ends_with("Framework") {
            ("cp3-llbb", "Framework", FRAMEWORK_HASH)
        } else {
            ("blinkseb", "TTAnalysis", ANALYSIS_HASH)
        };

        Ok(CodeVersion {
            hash: hash.to_owned(),
            repo: repo.to_owned(),
            url: format!("https://github.com/{owner}/{repo}/tree/{hash}"),
        })
    }
}

pub fn summary(event_weight_sum: f64, extras: &[(&str, f64)], entries: u64) -> FileSummary {
    FileSummary {
        event_weight_sum,
        extras_event_weight_sum: extras
            .iter()
            .map(|(key, value)| (key.to_string(), *value))
            .collect::<WeightSums>(),
        entries,
    }
}

pub fn dataset(name: &str, process: &str, nevents: u64, datatype: &str) -> NewDataset {
    NewDataset {
        name: name.to_owned(),
        process: process.to_owned(),
        nevents,
        xsection: 87.3,
        datatype: datatype.to_owned(),
        user_comment: String::new(),
    }
}

/// Scratch area with a configuration pointing inside it
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub config: GridConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GridConfig::default();
        config.framework.cmssw_base = Some(dir.path().to_owned());
        config.submission.work_area = dir.path().join("tasks");
        fs::create_dir_all(&config.submission.work_area).unwrap();

        Self { dir, config }
    }

    pub fn pset(&self) -> PathBuf {
        self.dir.path().join("TTAnalysis/test/TTConfiguration.py")
    }

    /// Create the task directory of a submitted task, returns it
    pub fn submitted_task(&self, name: &str, dataset: &str, is_mc: bool) -> PathBuf {
        let defaults = TaskDefaults {
            is_mc,
            work_area: self.config.submission.work_area.clone(),
            storage_site: "T2_BE_UCL".to_owned(),
            username: "me".to_owned(),
            default_lumi_mask: "Cert_JSON.txt".to_owned(),
        };
        let options = DatasetOptions {
            name: name.to_owned(),
            units_per_job: 5,
            era: Era::Ns25,
            global_tag: None,
            run_range: (!is_mc).then_some((256630, 260627)),
            certified_lumi_file: None,
        };

        let task = TaskConfig::for_dataset(&defaults, &self.pset(), "output_mc.root", dataset, &options)
            .unwrap();
        task.write_rendered(self.dir.path()).unwrap();

        let task_dir = task.task_dir();
        fs::create_dir_all(&task_dir).unwrap();
        task.save_request(&task_dir).unwrap();

        task_dir
    }

    pub fn services<'a>(
        &'a self,
        connection: &'a SharedConnection,
        client: &'a MockClient,
        inspector: &'a MockInspector,
        importer: &'a MockImporter,
    ) -> Services<'a> {
        Services {
            config: &self.config,
            connection,
            client,
            inspector,
            importer,
            versions: &FixedVersions,
            hostname: "ingrid-ui1".to_owned(),
            author: "me".to_owned(),
        }
    }
}
