//! Suggestions to remove task outputs left on the storage without a sample in the database.

use super::{directory_size, CleanupError};
use crate::{database::SharedConnection, util::sizeof_fmt};
use chrono::{Duration, Local, NaiveDateTime};
use std::{
    collections::HashSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

const SKIPPED_DATASETS: [&str; 2] = ["CRAB_PrivateMC", "testFiles"];

/// `now` minus `months` months of 31 days, as the integer `YYMMDDhhmmss`
pub fn date_minus_months(now: NaiveDateTime, months: i64) -> u64 {
    let then = now - Duration::days(31 * months);

    then.format("%y%m%d%H%M%S")
        .to_string()
        .parse()
        .unwrap_or_default()
}

/// Task output directory with no sample pointing to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleTask {
    // submission time as `YYMMDDhhmmss`
    pub timestamp: u64,
    pub path: PathBuf,
    pub size: u64,
}

fn subdirectories(path: &Path) -> Result<Vec<PathBuf>, CleanupError> {
    let entries = fs::read_dir(path).map_err(|source| CleanupError::Io {
        path: path.to_owned(),
        source,
    })?;

    let mut directories = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect::<Vec<_>>();
    directories.sort();

    Ok(directories)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Walk `<storage_dir>/<dataset>/<request>/<YYMMDD_hhmmss>/<task id>` for task
/// outputs submitted before `cutoff` that are not in `sample_paths`
pub fn find_stale_tasks(
    storage_dir: &Path,
    sample_paths: &HashSet<String>,
    cutoff: u64,
) -> Result<Vec<StaleTask>, CleanupError> {
    let mut stale = Vec::new();

    for dataset in subdirectories(storage_dir)? {
        let name = file_name(&dataset);
        if SKIPPED_DATASETS.iter().any(|skipped| name.contains(skipped)) {
            continue;
        }

        for request in subdirectories(&dataset)? {
            for stamp in subdirectories(&request)? {
                let Ok(timestamp) = file_name(&stamp).replace('_', "").parse::<u64>() else {
                    debug!(path = ?stamp, "Not a task time stamp");
                    continue;
                };
                if timestamp >= cutoff {
                    continue;
                }

                for task in subdirectories(&stamp)? {
                    if sample_paths.contains(task.to_string_lossy().as_ref()) {
                        continue;
                    }

                    let size = directory_size(&task);
                    stale.push(StaleTask {
                        timestamp,
                        path: task,
                        size,
                    });
                }
            }
        }
    }

    stale.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));

    Ok(stale)
}

/// Print the `rm -r` suggestions in the age buckets of the stale tasks
pub fn print_report<W: Write>(out: &mut W, stale: &[StaleTask], now: NaiveDateTime) -> Result<(), CleanupError> {
    let six = date_minus_months(now, 6);
    let three = date_minus_months(now, 3);
    let one = date_minus_months(now, 1);

    let buckets = [
        ("# Tasks older than 6 months", six, 0..six),
        ("# Tasks between 3 and 6 months old", three, six..three),
        ("# Tasks between 1 and 3 months old", one, three..one),
    ];

    for (title, timestamp, range) in buckets {
        writeln!(out, "{title}")?;
        writeln!(out, "# timestamp= {timestamp}")?;

        let tasks = stale
            .iter()
            .filter(|task| range.contains(&task.timestamp))
            .collect::<Vec<_>>();
        let total = tasks.iter().map(|task| task.size).sum();
        writeln!(out, "# totalSize= {}", sizeof_fmt(total))?;

        for task in tasks {
            writeln!(out, "# size= {}\nrm -r {}", sizeof_fmt(task.size), task.path.display())?;
        }
        writeln!(out)?;
    }

    Ok(())
}

/// List the task outputs of `username` older than a month that no sample uses
pub fn run<W: Write>(
    out: &mut W,
    connection: &SharedConnection,
    user_root: &Path,
    username: &str,
) -> Result<(), CleanupError> {
    writeln!(out, "##### Get the list of potential DB samples of interest")?;
    let sample_paths = connection
        .samples()?
        .into_iter()
        .filter(|sample| !sample.path.is_empty())
        .filter(|sample| sample.path.contains(username) || sample.author.contains(username))
        .map(|sample| sample.path)
        .collect::<HashSet<_>>();

    let storage_dir = user_root.join(username);
    writeln!(out, "##### Get the list of user paths in {}", storage_dir.display())?;

    let now = Local::now().naive_local();
    let stale = find_stale_tasks(&storage_dir, &sample_paths, date_minus_months(now, 1))?;
    info!("Found {} task outputs without a sample", stale.len());

    print_report(out, &stale, now)
}
