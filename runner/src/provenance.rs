//! Code provenance of a production.
//!
//! Every sample records which commits of the framework and of the analysis
//! were used to produce it, as GitHub tree URLs. The production tag derived
//! from both commits names the samples and the monitor state files.

use gridin_ingest::process::{run_captured, ProcessError};
use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error};

const GITHUB: &str = "https://github.com";

#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("Failed to run git")]
    Process(#[from] ProcessError),
    #[error("`git {args}` failed in {dir:?}: {stderr}")]
    Git {
        args: String,
        dir: PathBuf,
        stderr: String,
    },
    #[error("No fetch URL for remote {remote} in {dir:?}")]
    NoFetchUrl { remote: &'static str, dir: PathBuf },
    #[error("Aborting: your working tree for repository {repo} is dirty, please clean the changes not staged/committed before inserting this in the database")]
    Dirty { repo: String },
    #[error("Code from repository {repo} has not been pushed, it cannot be reproduced outside of this checkout")]
    NotPushed { repo: String },
    #[error("Malformed code version {0:?}, expected \"<analysis url> <framework url>\"")]
    MalformedCodeVersion(String),
}

/// A commit of a repository, as recorded in the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeVersion {
    // tag if one exists, commit hash otherwise
    pub hash: String,
    pub repo: String,
    pub url: String,
}

impl CodeVersion {
    /// Recover a version from its `.../<repo>/tree/<hash>` URL
    pub fn from_url(url: &str) -> Option<Self> {
        let (base, hash) = url.split_once("/tree/")?;
        let repo = base.rsplit('/').find(|segment| !segment.is_empty())?;
        let hash = hash.trim_matches('/');

        if hash.is_empty() {
            return None;
        }

        Some(Self {
            hash: hash.to_owned(),
            repo: repo.to_owned(),
            url: url.to_owned(),
        })
    }
}

/// Where code versions come from, git checkouts in production
pub trait VersionSource: Send + Sync {
    fn code_version(&self, directory: &Path) -> Result<CodeVersion, ProvenanceError>;
}

/// Owner and repository of a remote, from the output of `git remote show <remote>`
pub fn parse_fetch_url(output: &str) -> Option<(String, String)> {
    let url = output
        .lines()
        .find(|line| line.contains("Fetch URL"))?
        .split_once(':')?
        .1
        .trim();

    // both git@github.com:owner/repo.git and https://github.com/owner/repo.git
    let path = url.rsplit(':').next()?;
    let mut segments = path.rsplit('/').filter(|segment| !segment.is_empty());
    let repo = segments.next()?;
    let owner = segments.next()?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);

    Some((owner.to_owned(), repo.to_owned()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub owner: String,
    pub repo: String,
}

/// Pick the URL of `hash` from the remote branches containing it
pub fn resolve_url(
    hash: &str,
    branches: &str,
    origin: &Remote,
    upstream: Option<&Remote>,
) -> Result<CodeVersion, ProvenanceError> {
    let tree = |owner: &str, repo: &str, reference: &str| format!("{GITHUB}/{owner}/{repo}/tree/{reference}");

    if let (true, Some(upstream)) = (branches.contains("upstream"), upstream) {
        return Ok(CodeVersion {
            hash: hash.to_owned(),
            repo: upstream.repo.clone(),
            url: tree(&upstream.owner, &upstream.repo, hash),
        });
    }

    if branches.contains("origin") {
        return Ok(CodeVersion {
            hash: hash.to_owned(),
            repo: origin.repo.clone(),
            url: tree(&origin.owner, &origin.repo, hash),
        });
    }

    // pushed to another remote only, point to its branch
    if let Some((owner, branch)) = branches
        .lines()
        .map(str::trim)
        .find_map(|line| line.split_once('/'))
    {
        return Ok(CodeVersion {
            hash: hash.to_owned(),
            repo: origin.repo.clone(),
            url: tree(owner, &origin.repo, branch),
        });
    }

    Err(ProvenanceError::NotPushed {
        repo: upstream.unwrap_or(origin).repo.clone(),
    })
}

/// Reads code versions from git checkouts with the `git` CLI
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn git(&self, directory: &Path, args: &[&str]) -> Result<String, ProvenanceError> {
        let output = run_captured(Command::new("git").args(args).current_dir(directory), self.timeout)?;

        if output.success() {
            Ok(output.stdout)
        } else {
            Err(ProvenanceError::Git {
                args: args.join(" "),
                dir: directory.to_owned(),
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }

    fn remote(&self, directory: &Path, remote: &'static str) -> Result<Remote, ProvenanceError> {
        let output = self.git(directory, &["remote", "show", "-n", remote])?;

        parse_fetch_url(&output)
            .map(|(owner, repo)| Remote { owner, repo })
            .ok_or_else(|| ProvenanceError::NoFetchUrl {
                remote,
                dir: directory.to_owned(),
            })
    }
}

impl VersionSource for GitCli {
    fn code_version(&self, directory: &Path) -> Result<CodeVersion, ProvenanceError> {
        let origin = self.remote(directory, "origin")?;
        // forks without an upstream remote only have their origin
        let upstream = match self.remote(directory, "upstream") {
            Ok(upstream) => Some(upstream),
            Err(e) => {
                debug!(directory = ?directory, "No usable upstream remote: {e}");
                None
            }
        };

        let hash = self
            .git(directory, &["describe", "--tags", "--always", "--dirty"])?
            .trim()
            .to_owned();
        if hash.contains("dirty") {
            return Err(ProvenanceError::Dirty { repo: origin.repo });
        }

        let branches = self.git(directory, &["branch", "-r", "--contains", &hash])?;

        resolve_url(&hash, &branches, &origin, upstream.as_ref()).map_err(|e| {
            error!("PLEASE PUSH YOUR CODE! This result cannot be reproduced outside of this checkout");
            e
        })
    }
}

/// `<framework hash>_<analysis repo>_<analysis hash>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionTag {
    pub framework_hash: String,
    pub analysis_repo: String,
    pub analysis_hash: String,
}

impl fmt::Display for ProductionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.framework_hash, self.analysis_repo, self.analysis_hash
        )
    }
}

impl ProductionTag {
    /// Name of the sample a task produces
    pub fn sample_name(&self, request_name: &str) -> String {
        format!("{request_name}_{self}")
    }

    /// Monitor state file of the production
    pub fn state_file(&self) -> String {
        format!("prod_{self}.json")
    }

    /// Inverse of [`ProductionTag::state_file`]
    pub fn parse_state_file(file_name: &str) -> Option<Self> {
        let tag = file_name.strip_prefix("prod_")?.strip_suffix(".json")?;
        let (framework_hash, rest) = tag.split_once('_')?;
        let (analysis_repo, analysis_hash) = rest.rsplit_once('_')?;

        if [framework_hash, analysis_repo, analysis_hash]
            .iter()
            .any(|part| part.is_empty())
        {
            return None;
        }

        Some(Self {
            framework_hash: framework_hash.to_owned(),
            analysis_repo: analysis_repo.to_owned(),
            analysis_hash: analysis_hash.to_owned(),
        })
    }
}

/// Code versions of the framework and of the analysis behind a production
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub framework: CodeVersion,
    pub analysis: CodeVersion,
}

impl Provenance {
    pub fn resolve(
        source: &dyn VersionSource,
        framework_dir: &Path,
        analysis_dir: &Path,
    ) -> Result<Self, ProvenanceError> {
        Ok(Self {
            framework: source.code_version(framework_dir)?,
            analysis: source.code_version(analysis_dir)?,
        })
    }

    /// Parse a `code_version` column back
    pub fn parse(code_version: &str) -> Result<Self, ProvenanceError> {
        let malformed = || ProvenanceError::MalformedCodeVersion(code_version.to_owned());
        let mut urls = code_version.split_whitespace();

        let analysis = urls.next().and_then(CodeVersion::from_url).ok_or_else(malformed)?;
        let framework = urls.next().and_then(CodeVersion::from_url).ok_or_else(malformed)?;

        if urls.next().is_some() {
            return Err(malformed());
        }

        Ok(Self {
            framework,
            analysis,
        })
    }

    /// `"<analysis url> <framework url>"` as stored with every sample
    pub fn code_version(&self) -> String {
        format!("{} {}", self.analysis.url, self.framework.url)
    }

    pub fn tag(&self) -> ProductionTag {
        ProductionTag {
            framework_hash: self.framework.hash.clone(),
            analysis_repo: self.analysis.repo.clone(),
            analysis_hash: self.analysis.hash.clone(),
        }
    }
}

/// Directory of the analysis checkout a parameter set lives in
pub fn analysis_dir(pset: &Path) -> PathBuf {
    match pset.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMOTE_SHOW: &str = "* remote origin
  Fetch URL: git@github.com:blinkseb/Framework.git
  Push  URL: git@github.com:blinkseb/Framework.git
  HEAD branch: (not queried)
";

    fn origin() -> Remote {
        Remote {
            owner: "blinkseb".to_owned(),
            repo: "Framework".to_owned(),
        }
    }

    fn upstream() -> Remote {
        Remote {
            owner: "cp3-llbb".to_owned(),
            repo: "Framework".to_owned(),
        }
    }

    #[test]
    fn fetch_url_of_ssh_and_https_remotes() {
        assert_eq!(
            parse_fetch_url(REMOTE_SHOW),
            Some(("blinkseb".to_owned(), "Framework".to_owned()))
        );
        assert_eq!(
            parse_fetch_url("  Fetch URL: https://github.com/cp3-llbb/HHAnalysis.git\n"),
            Some(("cp3-llbb".to_owned(), "HHAnalysis".to_owned()))
        );
        assert_eq!(parse_fetch_url("* remote origin\n"), None);
    }

    #[test]
    fn upstream_branches_win() {
        let version = resolve_url(
            "v1.2.0+7415-79-ga5b16ff",
            "  origin/master\n  upstream/CMSSW_7_4_X\n",
            &origin(),
            Some(&upstream()),
        )
        .unwrap();

        assert_eq!(
            version.url,
            "https://github.com/cp3-llbb/Framework/tree/v1.2.0+7415-79-ga5b16ff"
        );
    }

    #[test]
    fn origin_without_upstream() {
        let version = resolve_url("f2f0a44", "  origin/master\n", &origin(), None).unwrap();

        assert_eq!(version.repo, "Framework");
        assert_eq!(version.url, "https://github.com/blinkseb/Framework/tree/f2f0a44");
    }

    #[test]
    fn other_remote_points_to_its_branch() {
        let version = resolve_url("f2f0a44", "  swertz/fix_jec\n", &origin(), Some(&upstream())).unwrap();

        assert_eq!(version.url, "https://github.com/swertz/Framework/tree/fix_jec");
        assert_eq!(version.hash, "f2f0a44");
    }

    #[test]
    fn unpushed_code_is_refused() {
        assert!(matches!(
            resolve_url("f2f0a44", "", &origin(), None),
            Err(ProvenanceError::NotPushed { .. })
        ));
    }

    #[test]
    fn tag_and_file_names() {
        let tag = ProductionTag {
            framework_hash: "v1.1.0+7415".to_owned(),
            analysis_repo: "TTAnalysis".to_owned(),
            analysis_hash: "1f0b2c3".to_owned(),
        };

        assert_eq!(tag.sample_name("TT_MiniAODv2"), "TT_MiniAODv2_v1.1.0+7415_TTAnalysis_1f0b2c3");
        assert_eq!(tag.state_file(), "prod_v1.1.0+7415_TTAnalysis_1f0b2c3.json");
        assert_eq!(ProductionTag::parse_state_file(&tag.state_file()), Some(tag));
    }

    #[test]
    fn state_file_with_underscored_repository() {
        let tag = ProductionTag::parse_state_file("prod_f2f0a44_HH_Analysis_0a1b2c3.json").unwrap();

        assert_eq!(tag.analysis_repo, "HH_Analysis");
        assert_eq!(tag.analysis_hash, "0a1b2c3");
        assert_eq!(ProductionTag::parse_state_file("prod_default.json"), None);
        assert_eq!(ProductionTag::parse_state_file("status.json"), None);
    }

    #[test]
    fn code_version_round_trip() {
        let code_version = "https://github.com/cp3-llbb/HHAnalysis/tree/d2c6a1e https://github.com/cp3-llbb/Framework/tree/v1.2.0+7415";
        let provenance = Provenance::parse(code_version).unwrap();

        assert_eq!(provenance.analysis.repo, "HHAnalysis");
        assert_eq!(provenance.framework.hash, "v1.2.0+7415");
        assert_eq!(provenance.code_version(), code_version);
        assert_eq!(provenance.tag().to_string(), "v1.2.0+7415_HHAnalysis_d2c6a1e");
        assert!(Provenance::parse("https://github.com/a/b/tree/c").is_err());
    }

    #[test]
    fn analysis_dir_of_pset() {
        assert_eq!(
            analysis_dir(Path::new("/cmssw/src/cp3_llbb/TTAnalysis/test/TTConfiguration.py")),
            PathBuf::from("/cmssw/src/cp3_llbb/TTAnalysis/test")
        );
        assert_eq!(analysis_dir(Path::new("Configuration.py")), PathBuf::from("."));
    }
}
