mod sqlite;

pub use sqlite::{InnerConnection, SharedConnection};

use crate::lumi::LumiMask;
use gridin_ingest::WeightSums;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ID = i64;

/// sample type of everything produced by the framework on the grid
pub const NTUPLES: &str = "NTUPLES";

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("SQLite error: {0}")]
    SQLite(rusqlite::Error),
    #[error("Failed to (de)serialize {column}: {source}")]
    Json {
        column: &'static str,
        source: serde_json::Error,
    },
    #[error("No dataset with such index: {0}")]
    UnknownDataset(ID),
    #[error("No sample with such index: {0}")]
    UnknownSample(ID),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: ID,
    pub name: String,
    pub process: String,
    pub nevents: u64,
    pub xsection: f64,
    pub datatype: String,
    pub user_comment: String,
}

impl Dataset {
    pub fn is_mc(&self) -> bool {
        self.datatype == "mc"
    }
}

/// A dataset as described by the dataset importer, before it gets an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDataset {
    pub name: String,
    pub process: String,
    pub nevents: u64,
    #[serde(default)]
    pub xsection: f64,
    pub datatype: String,
    #[serde(default)]
    pub user_comment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub sample_id: ID,
    pub name: String,
    pub path: String,
    pub sampletype: String,
    pub nevents_processed: u64,
    pub nevents: u64,
    pub normalization: f64,
    pub event_weight_sum: f64,
    pub extras_event_weight_sum: Option<String>,
    pub luminosity: Option<f64>,
    pub processed_lumi: Option<String>,
    pub code_version: String,
    pub user_comment: String,
    pub author: String,
    pub creation_time: String,
    pub source_dataset_id: Option<ID>,
    pub source_sample_id: Option<ID>,
}

impl Sample {
    pub fn extras(&self) -> Result<WeightSums, ConnectionError> {
        match self.extras_event_weight_sum.as_deref() {
            None | Some("") => Ok(WeightSums::new()),
            Some(json) => serde_json::from_str(json).map_err(|source| ConnectionError::Json {
                column: "extras_event_weight_sum",
                source,
            }),
        }
    }

    pub fn processed_lumi_mask(&self) -> Result<Option<LumiMask>, ConnectionError> {
        self.processed_lumi
            .as_deref()
            .map(LumiMask::from_json)
            .transpose()
            .map_err(|source| ConnectionError::Json {
                column: "processed_lumi",
                source,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub file_id: ID,
    pub sample_id: ID,
    pub lfn: String,
    pub pfn: String,
    pub event_weight_sum: f64,
    pub extras_event_weight_sum: String,
    pub nevents: u64,
}

/// A file about to be attached to a sample
#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub lfn: String,
    pub pfn: String,
    pub event_weight_sum: f64,
    // compact JSON object
    pub extras_event_weight_sum: String,
    pub nevents: u64,
}

impl From<FileRecord> for NewFile {
    fn from(file: FileRecord) -> Self {
        Self {
            lfn: file.lfn,
            pfn: file.pfn,
            event_weight_sum: file.event_weight_sum,
            extras_event_weight_sum: file.extras_event_weight_sum,
            nevents: file.nevents,
        }
    }
}

/// Everything written when a sample is created or updated.
///
/// The luminosity is not part of it, it is derived from the source dataset on save.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDraft {
    pub name: String,
    pub path: String,
    pub sampletype: String,
    pub nevents_processed: u64,
    pub nevents: u64,
    pub normalization: f64,
    pub event_weight_sum: f64,
    pub extras_event_weight_sum: WeightSums,
    pub processed_lumi: Option<LumiMask>,
    pub code_version: String,
    pub user_comment: String,
    pub author: String,
    pub source_dataset_id: ID,
    pub source_sample_id: Option<ID>,
    pub files: Vec<NewFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created(ID),
    Updated(ID),
}

impl SaveOutcome {
    pub fn id(&self) -> ID {
        match self {
            Self::Created(id) | Self::Updated(id) => *id,
        }
    }
}

/// Integrated luminosity of a simulated sample, `None` for data or unknown cross-sections
pub fn sample_luminosity(dataset: &Dataset, nevents_processed: u64, event_weight_sum: f64) -> Option<f64> {
    if !dataset.is_mc() || dataset.xsection <= 0.0 {
        return None;
    }

    if event_weight_sum != 0.0 {
        Some(event_weight_sum / dataset.xsection)
    } else {
        Some(nevents_processed as f64 / dataset.xsection)
    }
}

// ref: https://www.sqlite.org/lang_createtable.html
pub const SQL_SCHEMA: [&str; 4] = [
    "create table if not exists datasets (
    dataset_id integer primary key,
    name text not null unique,
    process text not null,
    nevents integer not null,
    xsection real not null default 0,
    datatype text not null,
    user_comment text not null default ''
);",
    "create table if not exists samples (
    sample_id integer primary key,
    name text not null unique,
    path text not null,
    sampletype text not null,
    nevents_processed integer not null,
    nevents integer not null,
    normalization real not null default 1,
    event_weight_sum real not null,
    extras_event_weight_sum text,
    luminosity real,
    processed_lumi text,
    code_version text not null,
    user_comment text not null default '',
    author text not null,
    creation_time text not null,

    source_dataset_id integer references datasets (dataset_id),
    source_sample_id integer references samples (sample_id)
);",
    "create table if not exists files (
    file_id integer primary key,
    sample_id integer not null references samples (sample_id) on delete cascade,
    lfn text not null,
    pfn text not null,
    event_weight_sum real not null,
    extras_event_weight_sum text not null,
    nevents integer not null
);",
    "create table if not exists results (
    result_id integer primary key,
    sample_id integer not null references samples (sample_id),
    path text not null,
    description text not null default ''
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
