mod common;

use common::*;
use gridin_runner::{
    database::{SampleDraft, SharedConnection, NTUPLES},
    grid::TaskStatus,
    monitor::{poll, print_summary, Buckets, MonitorError, StatusOptions, TaskState},
};
use std::{collections::BTreeMap, fs};

fn status(status: &str, jobs: &[(&str, u64)]) -> Result<TaskStatus, String> {
    Ok(TaskStatus {
        status: status.to_owned(),
        jobs_per_status: jobs
            .iter()
            .map(|(state, count)| (state.to_string(), *count))
            .collect::<BTreeMap<_, _>>(),
    })
}

fn options(workspace: &Workspace) -> StatusOptions {
    StatusOptions {
        directory: workspace.dir.path().to_owned(),
        ..StatusOptions::default()
    }
}

#[test]
fn tasks_are_bucketed() {
    let workspace = Workspace::new();
    for name in ["DY", "TT", "WW", "WZ", "ZZ"] {
        workspace.submitted_task(name, &format!("/{name}/RunII/MINIAODSIM"), true);
    }
    let connection = SharedConnection::open_in_memory().unwrap();
    let mut client = MockClient::default();
    client.statuses.insert("crab_DY".to_owned(), status("COMPLETED", &[("finished", 10)]));
    client.statuses.insert(
        "crab_TT".to_owned(),
        status("SUBMITTED", &[("running", 3), ("failed", 1)]),
    );
    client.statuses.insert(
        "crab_WW".to_owned(),
        Err("CachefileNotFound: no cache for this task".to_owned()),
    );
    client.statuses.insert("crab_WZ".to_owned(), status("TAPERECALL", &[]));
    client.statuses.insert("crab_ZZ".to_owned(), status("QUEUED", &[("idle", 4)]));
    let inspector = MockInspector::default();
    let importer = MockImporter::default();
    let services = workspace.services(&connection, &client, &inspector, &importer);

    let mut out = Vec::new();
    let (buckets, total) = poll(&mut out, &services, &options(&workspace)).unwrap();

    assert_eq!(total, 5);
    assert_eq!(buckets.get(TaskState::Completed), ["crab_DY"]);
    assert_eq!(buckets.get(TaskState::ToResubmit), ["crab_TT"]);
    assert_eq!(buckets.get(TaskState::SubmitFailed), ["crab_WW"]);
    assert_eq!(buckets.get(TaskState::Unknown), ["crab_WZ"]);
    assert_eq!(buckets.get(TaskState::Queued), ["crab_ZZ"]);

    let saved = Buckets::load(&workspace.dir.path().join("prod_default.json")).unwrap();
    assert_eq!(saved, buckets);

    let mut summary = Vec::new();
    print_summary(&mut summary, &buckets, total, &workspace.config.submission.work_area).unwrap();
    let summary = String::from_utf8(summary).unwrap();
    assert!(summary.contains("COMPLETED: 1\n"));
    assert!(summary.contains("gridin harvest "));
    assert!(summary.contains("crab_DY\n"));
}

#[test]
fn harvested_tasks_are_not_polled_again() {
    let workspace = Workspace::new();
    workspace.submitted_task("DY", "/DY/RunII/MINIAODSIM", true);
    workspace.submitted_task("TT", "/TT/RunII/MINIAODSIM", true);

    let connection = SharedConnection::open_in_memory().unwrap();
    let dataset_id = connection
        .insert_dataset(&dataset("/TT/RunII/MINIAODSIM", "TT", 100, "mc"))
        .unwrap();
    connection
        .save_sample(&SampleDraft {
            name: format!("TT_{TAG}"),
            path: "/storage/data/cms/store/user/me/TT".to_owned(),
            sampletype: NTUPLES.to_owned(),
            nevents_processed: 100,
            nevents: 10,
            normalization: 1.0,
            event_weight_sum: 100.0,
            extras_event_weight_sum: Default::default(),
            processed_lumi: None,
            code_version: String::new(),
            user_comment: String::new(),
            author: "me".to_owned(),
            source_dataset_id: dataset_id,
            source_sample_id: None,
            files: Vec::new(),
        })
        .unwrap();

    // the previous poll saw both tasks completed
    let mut previous = Buckets::new();
    previous.push(TaskState::Completed, "crab_DY");
    previous.push(TaskState::Completed, "crab_TT");
    let state_file = workspace.dir.path().join(format!("prod_{TAG}.json"));
    previous.save(&state_file).unwrap();

    let mut client = MockClient::default();
    client.statuses.insert("crab_DY".to_owned(), status("COMPLETED", &[]));
    let inspector = MockInspector::default();
    let importer = MockImporter::default();
    let services = workspace.services(&connection, &client, &inspector, &importer);

    let (buckets, _) = poll(&mut Vec::new(), &services, &options(&workspace)).unwrap();

    assert_eq!(buckets.get(TaskState::InDatabase), ["crab_TT"]);
    assert_eq!(buckets.get(TaskState::Completed), ["crab_DY"]);
    assert_eq!(*client.queried.lock().unwrap(), ["crab_DY"]);
    // the newest production file was picked up and updated
    assert_eq!(Buckets::load(&state_file).unwrap(), buckets);
}

#[test]
fn new_production_is_named_after_the_code() {
    let workspace = Workspace::new();
    workspace.submitted_task("TT", "/TT/RunII/MINIAODSIM", true);
    let connection = SharedConnection::open_in_memory().unwrap();
    let mut client = MockClient::default();
    client.statuses.insert("crab_TT".to_owned(), status("SUBMITTED", &[]));
    let inspector = MockInspector::default();
    let importer = MockImporter::default();
    let services = workspace.services(&connection, &client, &inspector, &importer);

    let options = StatusOptions {
        new: true,
        ..options(&workspace)
    };
    let mut out = Vec::new();
    poll(&mut out, &services, &options).unwrap();

    assert!(String::from_utf8(out)
        .unwrap()
        .contains(&format!("The output json will be: prod_{TAG}.json")));
    assert!(workspace.dir.path().join(format!("prod_{TAG}.json")).is_file());
}

#[test]
fn empty_work_area() {
    let workspace = Workspace::new();
    let connection = SharedConnection::open_in_memory().unwrap();
    let client = MockClient::default();
    let inspector = MockInspector::default();
    let importer = MockImporter::default();
    let services = workspace.services(&connection, &client, &inspector, &importer);

    assert!(matches!(
        poll(&mut Vec::new(), &services, &options(&workspace)),
        Err(MonitorError::NoTasks(_))
    ));
    assert!(!fs::read_dir(workspace.dir.path()).unwrap().any(|entry| entry
        .unwrap()
        .file_name()
        .to_string_lossy()
        .starts_with("prod_")));
}
