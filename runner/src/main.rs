use clap::Parser;
use gridin_ingest::ExecInspector;
use gridin_runner::{
    cleanup::{
        self,
        productions::{load_whitelist, CleanupOptions},
    },
    cli::{
        CleanProductionsArgs, CleanTasksArgs, Cli, Command, HarvestArgs, MergeArgs, StatusArgs,
        SubmitArgs,
    },
    config::{ConfigErrors, GridConfig},
    database::SharedConnection,
    datasets::load_catalogues,
    grid::{CrabClient, Retrying},
    harvest,
    importer::ExecImporter,
    merge::{self, MergeInputs},
    monitor::{self, StatusOptions},
    provenance::GitCli,
    services::Services,
    submit::{resolve_pset, Submission},
    task::TaskDefaults,
    util::{current_owner, hostname},
    RunnerError,
};
use parking_lot::Mutex;
use std::{error::Error, io, path::PathBuf, process};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

fn submit(config: &GridConfig, args: &SubmitArgs, author: String) -> Result<(), RunnerError> {
    let package_dir = config.framework.package_dir().ok();
    let pset = resolve_pset(&args.pset, package_dir.as_deref())?;
    let catalogue = load_catalogues(&args.datasets)?;
    info!("{} datasets to handle", catalogue.len());

    let client = CrabClient::load(&config.grid);
    let submission = Submission {
        defaults: TaskDefaults {
            is_mc: args.mc,
            work_area: config.submission.work_area.clone(),
            storage_site: config.submission.storage_site.clone(),
            username: config.submission.username.clone().unwrap_or(author),
            default_lumi_mask: config.submission.default_lumi_mask.clone(),
        },
        pset,
        output_file: args.output_file(),
        config_dir: PathBuf::from("."),
        client: if args.submit { Some(&client) } else { None },
    };

    let out = Mutex::new(io::stdout());
    match submission.run(&out, &catalogue, config.submission.workers)? {
        0 => Ok(()),
        failed => Err(RunnerError::Partial {
            failed,
            total: catalogue.len(),
        }),
    }
}

fn status(services: &Services, args: &StatusArgs) -> Result<(), RunnerError> {
    let options = StatusOptions {
        new: args.new,
        state_file: args.json.clone(),
        ..StatusOptions::default()
    };

    let mut out = io::stdout().lock();
    let (buckets, total) = monitor::poll(&mut out, services, &options)?;
    monitor::print_summary(
        &mut out,
        &buckets,
        total,
        &services.config.submission.work_area,
    )
    .map_err(monitor::MonitorError::Report)?;

    Ok(())
}

fn merge(services: &Services, args: &MergeArgs) -> Result<(), RunnerError> {
    let inputs = MergeInputs::new(args.ids.clone(), args.configs.clone())?;
    merge::run(&mut io::stdout().lock(), services, &inputs)?;

    Ok(())
}

/// Open the database and the external tools, hand them to `action` and close the database
fn with_services(
    config: &GridConfig,
    author: String,
    action: impl FnOnce(&Services) -> Result<(), RunnerError>,
) -> Result<(), RunnerError> {
    let connection = SharedConnection::load(&config.database.path)?;
    let client = Retrying::new(CrabClient::load(&config.grid), config.grid.attempts);
    let inspector = ExecInspector::new(
        config.inspector.exec.clone(),
        config.inspector.params.clone(),
        config.inspector.timeout(),
    );
    let importer = ExecImporter::load(&config.importer);
    let versions = GitCli::default();

    let services = Services {
        config,
        connection: &connection,
        client: &client,
        inspector: &inspector,
        importer: &importer,
        versions: &versions,
        hostname: hostname()?,
        author,
    };

    let result = action(&services);

    drop(services);
    connection.close()?;

    result
}

fn harvest(services: &Services, args: &HarvestArgs) -> Result<(), RunnerError> {
    match harvest::run(&mut io::stdout().lock(), services, &args.tasks) {
        0 => Ok(()),
        failed => Err(RunnerError::Partial {
            failed,
            total: args.tasks.len(),
        }),
    }
}

fn clean_productions(services: &Services, args: &CleanProductionsArgs) -> Result<(), RunnerError> {
    let whitelist = load_whitelist(&services.config.cleanup.whitelist)?;
    let options = CleanupOptions {
        crab_username: args
            .crab_username
            .clone()
            .unwrap_or_else(|| services.author.clone()),
        debug: args.debug,
        evaluate_size: args.evaluate_size,
    };

    cleanup::productions::run(
        &mut io::stdin().lock(),
        &mut io::stdout().lock(),
        services.connection,
        &whitelist,
        &options,
    )?;

    Ok(())
}

fn clean_tasks(services: &Services, args: &CleanTasksArgs) -> Result<(), RunnerError> {
    let username = args.username.as_deref().unwrap_or(&services.author);

    cleanup::tasks::run(
        &mut io::stdout().lock(),
        services.connection,
        &services.config.storage.user_root,
        username,
    )?;

    Ok(())
}

fn run(cli: Cli) -> Result<(), RunnerError> {
    let config = GridConfig::load(&cli.config)?;
    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }
    debug!(config = ?config, "Loaded configuration");

    let author = current_owner()?;

    // submission never touches the database
    match &cli.command {
        Command::Submit(args) => submit(&config, args, author),
        Command::Status(args) => with_services(&config, author, |services| status(services, args)),
        Command::Harvest(args) => with_services(&config, author, |services| harvest(services, args)),
        Command::Merge(args) => with_services(&config, author, |services| merge(services, args)),
        Command::CleanProductions(args) => {
            with_services(&config, author, |services| clean_productions(services, args))
        }
        Command::CleanTasks(args) => {
            with_services(&config, author, |services| clean_tasks(services, args))
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // stdout carries the operator report, logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter())),
        )
        .init();

    if let Err(e) = run(cli) {
        error!("{e}");

        let mut source = e.source();
        while let Some(cause) = source {
            error!("Caused by: {cause}");
            source = cause.source();
        }

        process::exit(1);
    }
}
