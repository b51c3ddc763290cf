use nix::unistd::{gethostname, Uid, User};
use std::{
    fs,
    io::{self, BufRead, Write},
    os::unix::fs::MetadataExt,
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtilError {
    #[error("Failed to stat {path:?}: {source}")]
    Stat { path: String, source: io::Error },
    #[error("Failed to look up user {uid}: {source}")]
    User { uid: u32, source: nix::Error },
    #[error("No user with uid {0}")]
    UnknownUser(u32),
    #[error("Failed to determine host name: {0}")]
    Hostname(nix::Error),
    #[error("Failed to read answer: {0}")]
    Prompt(#[from] io::Error),
}

const UNITS: [&str; 8] = ["", "k", "M", "G", "T", "P", "E", "Z"];

/// Human readable byte count, `1536` becomes `1.5kB`
pub fn sizeof_fmt(bytes: u64) -> String {
    let mut value = bytes as f64;

    for unit in UNITS {
        if value.abs() < 1024.0 {
            return format!("{value:3.1}{unit}B");
        }
        value /= 1024.0;
    }

    format!("{value:.1}YB")
}

/// Ask a yes/no question, an empty answer picks `default`
pub fn confirm<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    prompt: &str,
    default: bool,
) -> Result<bool, UtilError> {
    let choices = if default { "[y]|n" } else { "[n]|y" };

    loop {
        write!(output, "{prompt} {choices}: ")?;
        output.flush()?;

        let mut answer = String::new();
        if input.read_line(&mut answer)? == 0 {
            // closed input counts as the default
            return Ok(default);
        }

        match answer.trim() {
            "" => return Ok(default),
            "y" | "Y" => return Ok(true),
            "n" | "N" => return Ok(false),
            _ => writeln!(output, "please enter y or n.")?,
        }
    }
}

/// Name of the user owning `directory`
pub fn owner_of(directory: &Path) -> Result<String, UtilError> {
    let uid = fs::metadata(directory)
        .map_err(|source| UtilError::Stat {
            path: directory.to_string_lossy().into_owned(),
            source,
        })?
        .uid();

    User::from_uid(Uid::from_raw(uid))
        .map_err(|source| UtilError::User { uid, source })?
        .map(|user| user.name)
        .ok_or(UtilError::UnknownUser(uid))
}

/// Owner of the current working directory, the author of everything written to the database
pub fn current_owner() -> Result<String, UtilError> {
    owner_of(Path::new("."))
}

pub fn hostname() -> Result<String, UtilError> {
    gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .map_err(UtilError::Hostname)
}
