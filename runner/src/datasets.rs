use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("Failed to read dataset catalogue {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to parse dataset catalogue {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Dataset {dataset} is data but has no run_range")]
    MissingRunRange { dataset: String },
    #[error("No dataset listed in the given catalogues")]
    Empty,
}

/// Bunch spacing the framework is configured for
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Era {
    #[serde(rename = "25ns")]
    Ns25,
    #[serde(rename = "50ns")]
    Ns50,
}

impl fmt::Display for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ns25 => write!(f, "25ns"),
            Self::Ns50 => write!(f, "50ns"),
        }
    }
}

/// Submission options of a single dataset
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DatasetOptions {
    pub name: String,
    pub units_per_job: u32,
    pub era: Era,
    #[serde(rename = "globalTag", default, skip_serializing_if = "Option::is_none")]
    pub global_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_range: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certified_lumi_file: Option<String>,
}

/// dataset path -> options, ordered for reproducible submission logs
pub type Catalogue = BTreeMap<String, DatasetOptions>;

pub fn parse_catalogue(path: &Path, content: &str) -> Result<Catalogue, CatalogueError> {
    serde_json::from_str(content).map_err(|source| CatalogueError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Load and merge catalogues, later files override datasets of earlier ones
pub fn load_catalogues<P: AsRef<Path>>(paths: &[P]) -> Result<Catalogue, CatalogueError> {
    let mut catalogue = Catalogue::new();

    for path in paths.iter().map(AsRef::as_ref) {
        let content = fs::read_to_string(path).map_err(|source| CatalogueError::Read {
            path: path.to_owned(),
            source,
        })?;

        let loaded = parse_catalogue(path, &content)?;
        debug!(path = ?path, datasets = loaded.len(), "Loaded dataset catalogue");

        for (dataset, options) in loaded {
            if catalogue.insert(dataset.clone(), options).is_some() {
                warn!(dataset = %dataset, path = ?path, "Dataset listed twice, keeping the later entry");
            }
        }
    }

    if catalogue.is_empty() {
        return Err(CatalogueError::Empty);
    }

    Ok(catalogue)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MC: &str = r#"{
        "/TTTo2L2Nu_13TeV-powheg/RunIISpring15MiniAODv2-74X_mcRun2_asymptotic_v2-v1/MINIAODSIM": {
            "name": "TTTo2L2Nu_13TeV-powheg_MiniAODv2",
            "units_per_job": 10,
            "era": "25ns"
        }
    }"#;

    const DATA: &str = r#"{
        "/DoubleMuon/Run2015D-PromptReco-v4/MINIAOD": {
            "name": "DoubleMuon_Run2015D-PromptReco-v4",
            "units_per_job": 50,
            "era": "25ns",
            "globalTag": "74X_dataRun2_Prompt_v4",
            "run_range": [256630, 260627],
            "certified_lumi_file": "Cert_246908-260627_13TeV_PromptReco_Collisions15_25ns_JSON.txt"
        }
    }"#;

    #[test]
    fn parses_mc_and_data_entries() {
        let mc = parse_catalogue(Path::new("mc.json"), MC).unwrap();
        let options = mc.values().next().unwrap();
        assert_eq!(options.era, Era::Ns25);
        assert_eq!(options.units_per_job, 10);
        assert_eq!(options.global_tag, None);

        let data = parse_catalogue(Path::new("data.json"), DATA).unwrap();
        let options = &data["/DoubleMuon/Run2015D-PromptReco-v4/MINIAOD"];
        assert_eq!(options.run_range, Some((256630, 260627)));
        assert_eq!(options.global_tag.as_deref(), Some("74X_dataRun2_Prompt_v4"));
    }

    #[test]
    fn rejects_unknown_era() {
        let content = r#"{"/A/B/C": {"name": "a", "units_per_job": 1, "era": "100ns"}}"#;

        assert!(parse_catalogue(Path::new("bad.json"), content).is_err());
    }

    #[test]
    fn merges_files_later_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        fs::write(&first, MC).unwrap();
        fs::write(
            &second,
            MC.replace("\"units_per_job\": 10", "\"units_per_job\": 3"),
        )
        .unwrap();
        let third = dir.path().join("third.json");
        fs::write(&third, DATA).unwrap();

        let catalogue = load_catalogues(&[&first, &second, &third]).unwrap();

        assert_eq!(catalogue.len(), 2);
        assert_eq!(
            catalogue["/TTTo2L2Nu_13TeV-powheg/RunIISpring15MiniAODv2-74X_mcRun2_asymptotic_v2-v1/MINIAODSIM"]
                .units_per_job,
            3
        );
    }

    #[test]
    fn empty_catalogue_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.json");
        fs::write(&empty, "{}").unwrap();

        assert!(matches!(load_catalogues(&[&empty]), Err(CatalogueError::Empty)));
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            load_catalogues(&[Path::new("/nonexistent/datasets.json")]),
            Err(CatalogueError::Read { .. })
        ));
    }
}
