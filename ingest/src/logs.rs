use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info};

static EVENTS_READ: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<EventsRead>\s*(\d+)\s*</EventsRead>").expect("valid regex"));

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Failed to read log archive {path:?}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to list log directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn is_log_archive(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(".tar.gz") || name.ends_with(".tgz"))
        .unwrap_or(false)
}

fn is_job_report(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("FrameworkJobReport") && name.ends_with(".xml"))
        .unwrap_or(false)
}

/// Sum of all `<EventsRead>` values of a job report
pub fn events_read_in_report(report: &str) -> u64 {
    EVENTS_READ
        .captures_iter(report)
        .filter_map(|captures| captures[1].parse::<u64>().ok())
        .sum()
}

/// Events read by the job(s) whose logs are packed in `path`
pub fn events_read_in_archive(path: &Path) -> Result<u64, LogError> {
    let wrap = |source: io::Error| LogError::Archive {
        path: path.to_owned(),
        source,
    };

    let mut archive = Archive::new(GzDecoder::new(File::open(path).map_err(wrap)?));
    let mut total = 0;

    for entry in archive.entries().map_err(wrap)? {
        let mut entry = entry.map_err(wrap)?;
        let entry_path = entry.path().map_err(wrap)?.into_owned();

        if !is_job_report(&entry_path) {
            continue;
        }

        let mut report = String::new();
        entry.read_to_string(&mut report).map_err(wrap)?;
        let events = events_read_in_report(&report);

        debug!(archive = ?path, report = ?entry_path, events, "Scraped job report");
        total += events;
    }

    Ok(total)
}

/// Events read over every log archive in `directory`, `None` when there are no archives
pub fn events_read_in_directory(directory: &Path) -> Result<Option<u64>, LogError> {
    if !directory.is_dir() {
        return Ok(None);
    }

    let archives = fs::read_dir(directory)
        .and_then(|entries| {
            entries
                .map(|entry| entry.map(|entry| entry.path()))
                .collect::<Result<Vec<_>, _>>()
        })
        .map_err(|source| LogError::Directory {
            path: directory.to_owned(),
            source,
        })?
        .into_iter()
        .filter(|path| is_log_archive(path))
        .collect::<Vec<_>>();

    if archives.is_empty() {
        return Ok(None);
    }

    let mut total = 0;
    for archive in archives.iter() {
        total += events_read_in_archive(archive)?;
    }

    info!(archives = archives.len(), events = total, "Scraped events read from job logs");

    Ok(Some(total))
}
