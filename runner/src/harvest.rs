//! Registration of the outputs of finished tasks as samples.

use crate::{
    config::ConfigErrors,
    database::{ConnectionError, Dataset, NewFile, SampleDraft, SaveOutcome, NTUPLES},
    grid::GridError,
    importer::ImportError,
    progress::print_progress,
    provenance::{analysis_dir, Provenance, ProvenanceError},
    services::Services,
    task::{TaskConfig, TaskError},
};
use gridin_ingest::{
    logs::{events_read_in_directory, LogError},
    sum_dicts, InspectError, WeightSums, WeightsError,
};
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error(transparent)]
    Logs(#[from] LogError),
    #[error(transparent)]
    Weights(#[from] WeightsError),
    #[error("Expected exactly one dataset named {name:?}, found {count}")]
    AmbiguousDataset { name: String, count: usize },
    #[error("Task {0:?} has no output file")]
    NoOutput(PathBuf),
    #[error("Failed to inspect {path}: {source}. Please check the file and the job that produced it")]
    Inspect {
        path: String,
        #[source]
        source: InspectError,
    },
    #[error("Failed to write the report: {0}")]
    Report(#[from] io::Error),
}

/// Totals over the output files of a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputTotals {
    pub event_weight_sum: f64,
    pub extras_event_weight_sum: WeightSums,
    pub selected_events: u64,
    pub files: Vec<NewFile>,
}

/// Find the dataset by name, importing it first when the database doesn't know it
pub fn lookup_dataset(services: &Services, name: &str) -> Result<Dataset, HarvestError> {
    let mut datasets = services.connection.find_datasets_by_name(name)?;

    if datasets.is_empty() {
        info!(dataset = %name, "Dataset not in the database, importing it");
        let description = services.importer.describe(name)?;
        services.connection.insert_dataset(&description)?;
        datasets = services.connection.find_datasets_by_name(name)?;
    }

    match datasets.len() {
        1 => Ok(datasets.remove(0)),
        count => Err(HarvestError::AmbiguousDataset {
            name: name.to_owned(),
            count,
        }),
    }
}

/// Inspect every output file of a task, stops at the first unreadable file
pub fn inspect_outputs<W: Write>(
    out: &mut W,
    services: &Services,
    prefix: &str,
    files: &[(&str, &str)],
) -> Result<OutputTotals, HarvestError> {
    let mut totals = OutputTotals::default();

    print_progress(out, 0, files.len(), "Inspecting files")?;
    for (i, (lfn, pfn)) in files.iter().enumerate() {
        let path = format!("{prefix}{lfn}");
        let summary = services
            .inspector
            .inspect(&path)
            .map_err(|source| HarvestError::Inspect {
                path: path.clone(),
                source,
            })?;

        totals.event_weight_sum += summary.event_weight_sum;
        totals.extras_event_weight_sum =
            sum_dicts(&totals.extras_event_weight_sum, &summary.extras_event_weight_sum)?;
        totals.selected_events += summary.entries;

        let extras = serde_json::to_string(&summary.extras_event_weight_sum).map_err(|source| {
            ConnectionError::Json {
                column: "extras_event_weight_sum",
                source,
            }
        })?;
        totals.files.push(NewFile {
            lfn: lfn.to_string(),
            pfn: pfn.to_string(),
            event_weight_sum: summary.event_weight_sum,
            extras_event_weight_sum: extras,
            nevents: summary.entries,
        });

        print_progress(out, i + 1, files.len(), "Inspecting files")?;
    }

    Ok(totals)
}

/// Comment recorded with samples whose dataset was not entirely read
pub fn partial_processing_comment(processed: u64, total: u64) -> String {
    if processed == total {
        String::new()
    } else {
        format!("Sample was not fully processed, only {processed}/{total} events were processed")
    }
}

fn folder_of(lfn: &str) -> &str {
    lfn.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Register the outputs of the finished task in `task_dir`
#[instrument(skip(out, services), level = "debug")]
pub fn harvest_task<W: Write>(
    out: &mut W,
    services: &Services,
    task_dir: &Path,
) -> Result<SaveOutcome, HarvestError> {
    let request = TaskConfig::load_request(task_dir)?;
    writeln!(out, "##### Harvesting task {} #####", request.request_name())?;

    let dataset = lookup_dataset(services, &request.data.input_dataset)?;

    let listing = services.client.output_files(task_dir)?.checked(task_dir)?;
    let files = listing.files().collect::<Vec<_>>();
    let Some((first_lfn, _)) = files.first() else {
        return Err(HarvestError::NoOutput(task_dir.to_owned()));
    };
    let report = services.client.report(task_dir)?;

    let prefix = services.storage_prefix();
    let folder = format!("{prefix}{}", folder_of(first_lfn));

    let totals = inspect_outputs(out, services, prefix, &files)?;

    writeln!(out, "Sample folder: {folder}")?;
    writeln!(out, "∑w = {:.4}", totals.event_weight_sum)?;
    writeln!(out, "Number of selected events: {}", totals.selected_events)?;
    writeln!(
        out,
        "Number of output files (crab / really on the storage): {} / {}",
        listing.len(),
        totals.files.len()
    )?;

    let events_read = match report.num_events_read {
        Some(events) => Some(events),
        None => {
            info!("No event count in the task report, reading the job logs");
            events_read_in_directory(&task_dir.join("results"))?
        }
    };

    let nevents_processed = match events_read {
        Some(events) => events,
        None => {
            warn!(
                task = %request.request_name(),
                "Unable to tell how many events were processed, assuming the whole dataset was"
            );
            dataset.nevents
        }
    };

    if nevents_processed != dataset.nevents {
        let ratio = nevents_processed as f64 / dataset.nevents as f64 * 100.0;
        if dataset.is_mc() {
            warn!(
                "Only {nevents_processed}/{} events ({ratio:.2}%) of the dataset were processed. \
                 Harvest the task again once it is complete to update the sample",
                dataset.nevents
            );
        } else {
            info!(
                "{nevents_processed}/{} events ({ratio:.2}%) processed, expected for data filtered by a lumi mask",
                dataset.nevents
            );
        }
    }

    let processed_lumi = if request.is_data() {
        report.processed_lumis.filter(|mask| !mask.is_empty())
    } else {
        None
    };

    let provenance = Provenance::resolve(
        services.versions,
        &services.config.framework.framework_dir()?,
        &analysis_dir(&request.job_type.pset_name),
    )?;
    let name = provenance.tag().sample_name(request.request_name());

    let draft = SampleDraft {
        name: name.clone(),
        path: folder,
        sampletype: NTUPLES.to_owned(),
        nevents_processed,
        nevents: totals.selected_events,
        normalization: 1.0,
        event_weight_sum: totals.event_weight_sum,
        extras_event_weight_sum: totals.extras_event_weight_sum,
        processed_lumi,
        code_version: provenance.code_version(),
        user_comment: partial_processing_comment(nevents_processed, dataset.nevents),
        author: services.author.clone(),
        source_dataset_id: dataset.dataset_id,
        source_sample_id: None,
        files: totals.files,
    };

    let outcome = services.connection.save_sample(&draft)?;
    match outcome {
        SaveOutcome::Created(id) => writeln!(out, "Sample {name:?} created with id {id}")?,
        SaveOutcome::Updated(id) => writeln!(out, "Sample {name:?} (id {id}) updated")?,
    }

    Ok(outcome)
}

/// Harvest every task of `task_dirs`, returns the number of failures
pub fn run<W: Write>(out: &mut W, services: &Services, task_dirs: &[PathBuf]) -> u64 {
    let mut failed = 0;

    for task_dir in task_dirs {
        if let Err(e) = harvest_task(out, services, task_dir) {
            error!(task = ?task_dir, "Failed to harvest task: {e}");
            failed += 1;
        }
    }

    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_only_for_partial_samples() {
        assert_eq!(partial_processing_comment(10, 10), "");
        assert_eq!(
            partial_processing_comment(7, 10),
            "Sample was not fully processed, only 7/10 events were processed"
        );
    }

    #[test]
    fn sample_folder() {
        assert_eq!(
            folder_of("/store/user/me/TT/crab_TT/170101_120000/0000/output_1.root"),
            "/store/user/me/TT/crab_TT/170101_120000/0000"
        );
        assert_eq!(folder_of("output_1.root"), "");
    }
}
