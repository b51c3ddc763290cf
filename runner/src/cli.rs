use crate::database::ID;
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Submission and bookkeeping of grid productions", long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, default_value = "gridin.yaml")]
    pub config: PathBuf,

    /// More verbose logging, repeat for even more
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is not set
    pub fn default_log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "gridin_runner=info,gridin_ingest=info",
            1 => "gridin_runner=debug,gridin_ingest=debug",
            _ => "gridin_runner=trace,gridin_ingest=trace",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create (and optionally submit) one task per dataset
    Submit(SubmitArgs),
    /// Poll the tasks of the work area and suggest what to do next
    Status(StatusArgs),
    /// Register the outputs of finished tasks as samples
    Harvest(HarvestArgs),
    /// Merge samples of the same process into one extended sample
    Merge(MergeArgs),
    /// Delete outdated productions from the storage and the database
    CleanProductions(CleanProductionsArgs),
    /// List task outputs on the storage that no sample refers to
    CleanTasks(CleanTasksArgs),
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("kind").required(true).args(["mc", "data"])))]
pub struct SubmitArgs {
    /// JSON file(s) listing the datasets
    #[arg(short = 'f', long = "datasets", value_name = "FILE", required = true)]
    pub datasets: Vec<PathBuf>,

    /// Run over MC datasets
    #[arg(long)]
    pub mc: bool,

    /// Run over data datasets
    #[arg(long)]
    pub data: bool,

    /// Analysis configuration file, searched in the framework package if it isn't a path
    #[arg(short = 'c', long = "configuration", value_name = "FILE")]
    pub pset: PathBuf,

    /// Output file of the framework, defaults to output_mc.root or output_data.root
    #[arg(long)]
    pub output_file: Option<String>,

    /// Submit the tasks instead of only writing their configurations
    #[arg(long)]
    pub submit: bool,
}

impl SubmitArgs {
    pub fn output_file(&self) -> String {
        match &self.output_file {
            Some(file) => file.clone(),
            None if self.mc => "output_mc.root".to_owned(),
            None => "output_data.root".to_owned(),
        }
    }
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Start monitoring a new production
    #[arg(long)]
    pub new: bool,

    /// State file of the production
    #[arg(short, long, value_name = "FILE", default_value = crate::monitor::DEFAULT_STATE_FILE)]
    pub json: PathBuf,
}

#[derive(Args, Debug)]
pub struct HarvestArgs {
    /// Task directories
    #[arg(value_name = "DIR", required = true)]
    pub tasks: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Ids of the samples to merge
    #[arg(short = 'i', value_name = "SAMPLE_ID", num_args = 1.., conflicts_with = "configs")]
    pub ids: Vec<ID>,

    /// Task configurations whose samples are merged
    #[arg(short = 'c', value_name = "FILE", num_args = 1..)]
    pub configs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CleanProductionsArgs {
    /// Grid storage user name, defaults to the owner of the working directory
    #[arg(long)]
    pub crab_username: Option<String>,

    /// Only look at one production and do not delete anything
    #[arg(long)]
    pub debug: bool,

    /// Evaluate the disk size that would be freed
    #[arg(short = 's', long)]
    pub evaluate_size: bool,
}

#[derive(Args, Debug)]
pub struct CleanTasksArgs {
    /// Storage user name, defaults to the owner of the working directory
    #[arg(long)]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn submit_needs_a_kind() {
        assert!(Cli::try_parse_from(["gridin", "submit", "-f", "a.json", "-c", "pset.py"]).is_err());
        assert!(
            Cli::try_parse_from(["gridin", "submit", "-f", "a.json", "-c", "pset.py", "--mc", "--data"])
                .is_err()
        );

        let cli = Cli::try_parse_from([
            "gridin", "-v", "submit", "-f", "a.json", "-f", "b.json", "-c", "pset.py", "--data",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        let Command::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.datasets.len(), 2);
        assert_eq!(args.output_file(), "output_data.root");
    }

    #[test]
    fn merge_takes_ids_or_configs() {
        let cli = Cli::try_parse_from(["gridin", "merge", "-i", "3", "4"]).unwrap();
        let Command::Merge(args) = cli.command else {
            panic!("expected merge");
        };
        assert_eq!(args.ids, vec![3, 4]);

        assert!(Cli::try_parse_from(["gridin", "merge", "-i", "3", "-c", "crab_TT.py"]).is_err());
    }

    #[test]
    fn status_defaults() {
        let cli = Cli::try_parse_from(["gridin", "status"]).unwrap();
        let Command::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert!(!args.new);
        assert_eq!(args.json, PathBuf::from("prod_default.json"));
        assert_eq!(cli.config, PathBuf::from("gridin.yaml"));
    }
}
