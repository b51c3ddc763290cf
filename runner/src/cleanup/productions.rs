//! Deletion of outdated productions, from the storage and from the database.
//!
//! A production is the set of samples sharing a framework tag and an analysis
//! tag, both read back from the sample names.

use super::{directory_size, CleanupError};
use crate::{
    database::{Sample, SharedConnection},
    util::{confirm, sizeof_fmt},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::BTreeMap,
    fs,
    io::{BufRead, Write},
    path::Path,
};
use tracing::{debug, info, warn};

// a release tag (v1.2.0+7415), optionally followed by the commits since (-79-ga5b16ff), or a bare hash
static FRAMEWORK_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(v\d+.\d+.\d+\+\d+X?)(-\d+-g[0-9a-f]{7,40})?|[0-9a-f]{7,40})")
        .expect("valid regex")
});

/// analysis name to the `<framework tag>_<analysis>_<analysis tag>` productions to keep
pub type Whitelist = BTreeMap<String, Vec<String>>;

pub fn load_whitelist(path: &Path) -> Result<Whitelist, CleanupError> {
    let content = fs::read_to_string(path).map_err(|source| CleanupError::Io {
        path: path.to_owned(),
        source,
    })?;

    serde_json::from_str(&content).map_err(|source| CleanupError::Whitelist {
        path: path.to_owned(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Production {
    pub framework_tag: String,
    pub analysis_tag: String,
}

impl Production {
    pub fn contains(&self, sample_name: &str) -> bool {
        sample_name.contains(&self.framework_tag) && sample_name.contains(&self.analysis_tag)
    }
}

pub fn is_protected(sample_name: &str, whitelist: &Whitelist) -> bool {
    whitelist.iter().any(|(analysis, productions)| {
        let separator = format!("_{analysis}_");
        productions.iter().any(|production| {
            production
                .split_once(&separator)
                .is_some_and(|(framework, analysis)| {
                    sample_name.contains(framework) && sample_name.contains(analysis)
                })
        })
    })
}

/// The production a sample belongs to, `None` for whitelisted ones
pub fn production_of(sample_name: &str, whitelist: &Whitelist) -> Result<Option<Production>, CleanupError> {
    if is_protected(sample_name, whitelist) {
        debug!(sample = %sample_name, "Skipping whitelisted sample");
        return Ok(None);
    }

    let stripped = whitelist
        .keys()
        .fold(sample_name.to_owned(), |name, analysis| name.replace(analysis.as_str(), ""));

    let mut fields = stripped.split('_').collect::<Vec<_>>();
    let analysis_tag = fields.pop().unwrap_or_default().to_owned();
    let framework_tags = fields
        .into_iter()
        .filter(|field| FRAMEWORK_TAG.is_match(field))
        .collect::<Vec<_>>();

    match framework_tags.as_slice() {
        [framework_tag] => Ok(Some(Production {
            framework_tag: framework_tag.to_string(),
            analysis_tag,
        })),
        _ => Err(CleanupError::SpuriousTags {
            sample: sample_name.to_owned(),
            tags: framework_tags.iter().map(|tag| tag.to_string()).collect(),
        }),
    }
}

/// Productions of `samples` in order of first appearance
pub fn list_productions(samples: &[Sample], whitelist: &Whitelist) -> Result<Vec<Production>, CleanupError> {
    let mut productions: Vec<Production> = Vec::new();

    for sample in samples {
        if productions.iter().any(|production| production.contains(&sample.name)) {
            continue;
        }

        if let Some(production) = production_of(&sample.name, whitelist)? {
            productions.push(production);
        }
    }

    Ok(productions)
}

pub struct CleanupOptions {
    pub crab_username: String,
    // only look at the first production and print instead of deleting
    pub debug: bool,
    pub evaluate_size: bool,
}

/// Why a production can't be removed without breaking the bookkeeping
fn blocker(connection: &SharedConnection, sample: &Sample) -> Result<Option<&'static str>, CleanupError> {
    if sample.source_sample_id.is_some() {
        return Ok(Some("depends on another sample"));
    }
    if connection.count_derived_samples(sample.sample_id)? > 0 {
        return Ok(Some("has derived samples"));
    }
    if connection.count_results(sample.sample_id)? > 0 {
        return Ok(Some("has derived results"));
    }

    Ok(None)
}

fn remove_sample_folders<W: Write>(out: &mut W, sample: &Sample, debug: bool) -> Result<(), CleanupError> {
    let parent = sample.path.rsplit_once("/0000").map(|(parent, _)| parent);

    if debug {
        writeln!(out, "rm -r {}", sample.path)?;
        if let Some(parent) = parent {
            writeln!(out, "rm -r {parent}")?;
        }
        return Ok(());
    }

    let removed = fs::remove_dir_all(&sample.path).and_then(|_| match parent {
        Some(parent) => fs::remove_dir_all(parent),
        None => Ok(()),
    });

    if let Err(e) = removed {
        warn!(path = %sample.path, "Failed to delete sample folder: {e}");
        writeln!(out, "Seems we have a buggy path: {}", sample.path)?;
        writeln!(out, "deleting the DB entry then moving on...")?;
    }

    Ok(())
}

/// Offer every unprotected production of the user for deletion
pub fn run<R: BufRead, W: Write>(
    input: &mut R,
    out: &mut W,
    connection: &SharedConnection,
    whitelist: &Whitelist,
    options: &CleanupOptions,
) -> Result<(), CleanupError> {
    if options.debug {
        writeln!(out, "RUNNING IN DEBUG MODE")?;
        writeln!(out, "Nothing will be deleted\n")?;
    }

    writeln!(out, "##### Get the list of potential DB samples of interest")?;
    let samples = connection
        .samples()?
        .into_iter()
        .filter(|sample| sample.path.contains(&options.crab_username))
        .collect::<Vec<_>>();

    writeln!(out, "##### Get the list of existing productions")?;
    let productions = list_productions(&samples, whitelist)?;
    info!("Found {} productions in {} samples", productions.len(), samples.len());

    let productions = if options.debug {
        &productions[..productions.len().min(1)]
    } else {
        &productions[..]
    };

    'productions: for production in productions {
        let members = samples
            .iter()
            .filter(|sample| production.contains(&sample.name))
            .collect::<Vec<_>>();

        writeln!(
            out,
            "\n##### Now looking at prod FWtag= {} Anatag= {} and list the associated folders{}",
            production.framework_tag,
            production.analysis_tag,
            if options.evaluate_size {
                ""
            } else {
                " (evaluation of the disk size is OFF by default)"
            }
        )?;

        let mut total_size = 0;
        for sample in &members {
            if let Some(reason) = blocker(connection, sample)? {
                writeln!(out, "WARNING, the sample {} {reason}, aborting now", sample.name)?;
                continue 'productions;
            }

            if options.evaluate_size {
                total_size += directory_size(Path::new(&sample.path));
            }
            writeln!(out, "{}", sample.path)?;
        }

        writeln!(
            out,
            "\tFWtag= {} Anatag= {} totalSamples= {} totalSize= {total_size} ({})",
            production.framework_tag,
            production.analysis_tag,
            members.len(),
            sizeof_fmt(total_size)
        )?;

        if !confirm(
            input,
            out,
            "\tDo you REALLY want to DELETE this prod from disk and from the database?",
            false,
        )? {
            continue;
        }

        for sample in members {
            remove_sample_folders(out, sample, options.debug)?;

            if options.debug {
                writeln!(out, "remove sample {} from the database", sample.sample_id)?;
            } else {
                connection.remove_sample(sample.sample_id)?;
                info!(sample = %sample.name, "Sample removed");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> Whitelist {
        serde_json::from_str(r#"{"HHAnalysis": ["v1.2.0+7415-79-ga5b16ff_HHAnalysis_0123abc"]}"#).unwrap()
    }

    #[test]
    fn framework_tags() {
        for tag in ["v1.2.0+7415", "v1.2.0+7415X", "v1.2.0+7415-79-ga5b16ff", "f2f0a44"] {
            assert!(FRAMEWORK_TAG.is_match(tag), "{tag}");
        }
        for field in ["TT", "13TeV", "abc", ""] {
            assert!(!FRAMEWORK_TAG.is_match(field), "{field}");
        }
    }

    #[test]
    fn whitelisted_samples_are_protected() {
        assert!(is_protected(
            "TT_v1.2.0+7415-79-ga5b16ff_HHAnalysis_0123abc",
            &whitelist()
        ));
        assert_eq!(
            production_of("TT_v1.2.0+7415-79-ga5b16ff_HHAnalysis_0123abc", &whitelist()).unwrap(),
            None
        );
    }

    #[test]
    fn production_tags_are_read_from_the_name() {
        let production = production_of("DY_f2f0a44_HHAnalysis_1234567", &whitelist())
            .unwrap()
            .unwrap();

        assert_eq!(
            production,
            Production {
                framework_tag: "f2f0a44".to_owned(),
                analysis_tag: "1234567".to_owned(),
            }
        );
        assert!(production.contains("WW_f2f0a44_HHAnalysis_1234567"));
        assert!(!production.contains("WW_f2f0a44_HHAnalysis_7654321"));
    }

    #[test]
    fn ambiguous_framework_tags_are_an_error() {
        assert!(matches!(
            production_of("DY_deadbeef_f2f0a44_HHAnalysis_1234567", &whitelist()),
            Err(CleanupError::SpuriousTags { tags, .. }) if tags.len() == 2
        ));
        assert!(matches!(
            production_of("DY_HHAnalysis_1234567", &whitelist()),
            Err(CleanupError::SpuriousTags { tags, .. }) if tags.is_empty()
        ));
    }
}
