//! Merging of samples produced from extensions of the same process into one
//! artificial sample. Quantities that make no sense for a merge (the path,
//! the source dataset) are taken from the first sample.

use crate::{
    config::ConfigErrors,
    database::{ConnectionError, Dataset, NewFile, Sample, SampleDraft, SaveOutcome, ID, NTUPLES},
    harvest::partial_processing_comment,
    lumi::LumiMask,
    provenance::{analysis_dir, Provenance, ProvenanceError},
    services::Services,
    task::{TaskConfig, TaskError},
};
use gridin_ingest::weights::accumulate;
use itertools::Itertools;
use std::{
    io::{self, Write},
    path::PathBuf,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Give either sample ids or task configurations, not both")]
    ConflictingInputs,
    #[error("At least two samples are needed for a merge, got {0}")]
    NotEnoughSamples(usize),
    #[error("Sample {0} does not exist in the database, please insert it first")]
    UnknownSample(String),
    #[error("Not all samples are from the same process ({0}), merging them is asking for trouble")]
    DifferentProcesses(String),
    #[error("Sample {0} would be merged with itself")]
    DuplicateSample(ID),
    #[error("Several samples inherit from dataset {0}")]
    DuplicateDataset(ID),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Failed to write the report: {0}")]
    Report(#[from] io::Error),
}

/// The samples to merge, by id or by the task configurations that produced them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeInputs {
    Ids(Vec<ID>),
    Configs(Vec<PathBuf>),
}

impl MergeInputs {
    pub fn new(ids: Vec<ID>, configs: Vec<PathBuf>) -> Result<Self, MergeError> {
        let inputs = match (ids.is_empty(), configs.is_empty()) {
            (false, false) => return Err(MergeError::ConflictingInputs),
            (false, true) => Self::Ids(ids),
            _ => Self::Configs(configs),
        };

        if inputs.len() < 2 {
            return Err(MergeError::NotEnoughSamples(inputs.len()));
        }

        Ok(inputs)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Ids(ids) => ids.len(),
            Self::Configs(configs) => configs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sample taking part in a merge, with the dataset it was produced from
#[derive(Debug, Clone)]
pub struct MergeMember {
    pub sample: Sample,
    pub dataset: Dataset,
}

fn member(services: &Services, sample: Option<Sample>, label: String) -> Result<MergeMember, MergeError> {
    let sample = sample.ok_or(MergeError::UnknownSample(label))?;
    let dataset_id = sample
        .source_dataset_id
        .ok_or(ConnectionError::UnknownSample(sample.sample_id))?;
    let dataset = services
        .connection
        .find_dataset(dataset_id)?
        .ok_or(ConnectionError::UnknownDataset(dataset_id))?;

    Ok(MergeMember { sample, dataset })
}

/// Resolve the code versions and the samples behind `inputs`
pub fn collect_members(
    services: &Services,
    inputs: &MergeInputs,
) -> Result<(Provenance, Vec<MergeMember>), MergeError> {
    match inputs {
        MergeInputs::Configs(configs) => {
            let tasks = configs
                .iter()
                .map(|path| TaskConfig::load_rendered(path))
                .collect::<Result<Vec<_>, _>>()?;

            let provenance = Provenance::resolve(
                services.versions,
                &services.config.framework.framework_dir()?,
                &analysis_dir(&tasks[0].job_type.pset_name),
            )?;
            let tag = provenance.tag();

            let members = tasks
                .iter()
                .map(|task| {
                    let name = tag.sample_name(task.request_name());
                    let sample = services.connection.find_sample_by_name(&name)?;
                    member(services, sample, name)
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok((provenance, members))
        }
        MergeInputs::Ids(ids) => {
            let members = ids
                .iter()
                .map(|id| {
                    let sample = services.connection.find_sample(*id)?;
                    member(services, sample, id.to_string())
                })
                .collect::<Result<Vec<_>, _>>()?;

            let provenance = Provenance::parse(&members[0].sample.code_version)?;

            Ok((provenance, members))
        }
    }
}

/// Refuse merges of different processes or of the same sample or dataset twice
pub fn validate(members: &[MergeMember]) -> Result<(), MergeError> {
    let processes = members
        .iter()
        .map(|member| member.dataset.process.as_str())
        .unique()
        .collect::<Vec<_>>();
    if processes.len() != 1 {
        return Err(MergeError::DifferentProcesses(processes.join(", ")));
    }

    if let Some(id) = members.iter().map(|member| member.sample.sample_id).duplicates().next() {
        return Err(MergeError::DuplicateSample(id));
    }

    if let Some(id) = members.iter().map(|member| member.dataset.dataset_id).duplicates().next() {
        return Err(MergeError::DuplicateDataset(id));
    }

    Ok(())
}

/// `<process>_extended_<id0>_plus_<id1>..._<tag>`
pub fn merged_name(members: &[MergeMember], provenance: &Provenance) -> String {
    let process = members
        .first()
        .map(|member| member.dataset.process.as_str())
        .unwrap_or_default();
    let ids = members
        .iter()
        .map(|member| member.sample.sample_id.to_string())
        .join("_plus_");

    provenance
        .tag()
        .sample_name(&format!("{process}_extended_{ids}"))
}

/// Sum the members into a single sample
pub fn merged_draft(
    services: &Services,
    members: &[MergeMember],
    provenance: &Provenance,
) -> Result<SampleDraft, MergeError> {
    let mut draft = SampleDraft {
        name: merged_name(members, provenance),
        path: String::new(),
        sampletype: NTUPLES.to_owned(),
        nevents_processed: 0,
        nevents: 0,
        normalization: 1.0,
        event_weight_sum: 0.0,
        extras_event_weight_sum: Default::default(),
        processed_lumi: None,
        code_version: provenance.code_version(),
        user_comment: String::new(),
        author: services.author.clone(),
        source_dataset_id: members[0].dataset.dataset_id,
        source_sample_id: Some(members[0].sample.sample_id),
        files: Vec::new(),
    };

    let mut processed_lumi = LumiMask::new();
    let mut dataset_nevents = 0;

    for MergeMember { sample, dataset } in members {
        draft.nevents_processed += sample.nevents_processed;
        draft.nevents += sample.nevents;
        draft.event_weight_sum += sample.event_weight_sum;
        accumulate(&mut draft.extras_event_weight_sum, &sample.extras()?);

        if let Some(mask) = sample.processed_lumi_mask()? {
            processed_lumi.union_with(&mask);
        }

        let files = services.connection.files_for_sample(sample.sample_id)?;
        debug!(sample = sample.sample_id, files = files.len(), "Copying files");
        draft.files.extend(files.into_iter().map(NewFile::from));

        dataset_nevents += dataset.nevents;
    }

    if !processed_lumi.is_empty() {
        draft.processed_lumi = Some(processed_lumi);
    }
    draft.user_comment = partial_processing_comment(draft.nevents_processed, dataset_nevents);

    Ok(draft)
}

/// Merge the samples of `inputs` and save the result
pub fn run<W: Write>(
    out: &mut W,
    services: &Services,
    inputs: &MergeInputs,
) -> Result<SaveOutcome, MergeError> {
    writeln!(out, "##### Running on several tasks: will (attempt to) merge them in a single sample")?;

    let (provenance, members) = collect_members(services, inputs)?;
    writeln!(out, "FWUrl= {}", provenance.framework.url)?;
    writeln!(out, "AnaUrl= {}", provenance.analysis.url)?;

    validate(&members)?;
    writeln!(out, "done: all samples exist and inherit from the same process")?;

    let draft = merged_draft(services, &members, &provenance)?;
    let outcome = services.connection.save_sample(&draft)?;

    match outcome {
        SaveOutcome::Created(id) => info!(sample = %draft.name, id, "Merged sample created"),
        SaveOutcome::Updated(id) => info!(sample = %draft.name, id, "Merged sample updated"),
    }
    writeln!(out, "Merged sample {:?} saved with id {}", draft.name, outcome.id())?;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_need_one_kind_of_at_least_two_samples() {
        assert!(matches!(
            MergeInputs::new(vec![1, 2], vec![PathBuf::from("crab_TT.py")]),
            Err(MergeError::ConflictingInputs)
        ));
        assert!(matches!(
            MergeInputs::new(vec![1], vec![]),
            Err(MergeError::NotEnoughSamples(1))
        ));
        assert!(matches!(
            MergeInputs::new(vec![], vec![]),
            Err(MergeError::NotEnoughSamples(0))
        ));
        assert_eq!(
            MergeInputs::new(vec![3, 4], vec![]).unwrap(),
            MergeInputs::Ids(vec![3, 4])
        );
    }
}
