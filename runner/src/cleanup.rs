//! Reclaiming storage from productions and tasks that are no longer needed.

pub mod productions;
pub mod tasks;

use crate::{database::ConnectionError, util::UtilError};
use ignore::WalkBuilder;
use std::{io, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Failed to read {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to parse the whitelist {path:?}: {source}")]
    Whitelist {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("There are spurious things in the name of sample {sample:?}, please figure out what is happening: framework tags {tags:?}")]
    SpuriousTags { sample: String, tags: Vec<String> },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Util(#[from] UtilError),
    #[error("Failed to write the report: {0}")]
    Report(#[from] io::Error),
}

/// Bytes used by the files below `path`, unreadable entries are skipped
pub fn directory_size(path: &Path) -> u64 {
    WalkBuilder::new(path)
        .standard_filters(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to walk {path:?}: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn size_of_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("0000/log")).unwrap();
        fs::write(dir.path().join("0000/output_1.root"), [0u8; 100]).unwrap();
        fs::write(dir.path().join("0000/log/cmsRun_1.log.tar.gz"), [0u8; 20]).unwrap();
        fs::write(dir.path().join(".hidden"), [0u8; 3]).unwrap();

        assert_eq!(directory_size(dir.path()), 123);
    }

    #[test]
    fn size_of_missing_directory() {
        assert_eq!(directory_size(Path::new("/nonexistent/gridin")), 0);
    }
}
