//! Submits one job to a local [`hither_manager::JobManager`] and waits for it, printing its
//! result (or error) to the terminal. Enough to exercise the manager end-to-end without writing
//! a harness; not a replacement for embedding `hither-manager` directly in a real pipeline.

mod functions;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hither_base::{ContainerImage, FunctionCode, FunctionRegistry, JobFlags, Value};
use hither_cache::DirJobCache;
use hither_container::{NullContainerRunner, ProcessContainerRunner};
use hither_handler::DefaultJobHandler;
use hither_manager::{HandlerId, JobManager, SubmitJob, WaitOutcome};
use hither_store::LocalContentStore;
use hither_util::config::{base_directories, default_data_dir};
use hither_util::{root_logger, LogLevel};
use slog::info;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder as RuntimeBuilder;

/// Submit one job and wait for it.
#[derive(Parser, Debug)]
#[command(name = "hither-run")]
struct Config {
    /// Name of the registered function to call. Pass `--list` to see what's built in.
    function: Option<String>,

    /// Version of the function to call.
    #[arg(long, default_value = "1")]
    version: String,

    /// The job's keyword arguments, as JSON matching the wire `Value` grammar (e.g.
    /// `{"_type":"map","entries":[["a",{"_type":"int",...
    #[arg(long, default_value = "null")]
    kwargs: String,

    /// Run the job inside this container image (`docker://...` or `singularity://...`) instead
    /// of directly on the host.
    #[arg(long)]
    container: Option<String>,

    /// Abort the job if it hasn't finished after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Minimum severity of log messages to print.
    #[arg(long, default_value = "warning")]
    log_level: LogLevel,

    /// List the built-in demo functions this binary knows how to call, then exit.
    #[arg(long)]
    list: bool,
}

fn main() -> Result<ExitCode> {
    let config = Config::parse();
    let log = root_logger(config.log_level);

    if config.list {
        for (name, version, description) in functions::CATALOG {
            println!("{name} v{version} -- {description}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let Some(function) = config.function.clone() else {
        bail!("no function given; pass a function name or --list to see what's available");
    };

    let base_directories =
        base_directories("hither/run").context("resolving XDG base directories")?;
    let data_dir = default_data_dir(&base_directories).context("resolving data directory")?;
    let kwargs: Value =
        serde_json::from_str(&config.kwargs).context("parsing --kwargs as a Value")?;
    let container = config
        .container
        .as_deref()
        .map(ContainerImage::parse)
        .transpose()?;

    let registry = FunctionRegistry::new();
    functions::register_all(&registry)?;

    // `JobManager` drives its own internal tokio runtime synchronously (see its docs), so the
    // store and cache are opened on a throwaway runtime that exits before the manager is ever
    // ticked -- a `Runtime::block_on` call nested inside another runtime's task panics, and the
    // manager's own bridge runtime would be exactly that if `wait` ran from inside this one.
    let setup = RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .context("starting setup runtime")?;
    let store: Arc<dyn hither_store::ContentStore> = Arc::new(
        setup
            .block_on(LocalContentStore::new(data_dir.join("blobs")))
            .context("opening content store")?,
    );
    let cache: Arc<dyn hither_cache::JobCache> = Arc::new(
        setup
            .block_on(DirJobCache::new(data_dir.join("cache")))
            .context("opening job cache")?,
    );
    drop(setup);

    let runner: Arc<dyn hither_container::ContainerRunner> = if container.is_some() {
        Arc::new(ProcessContainerRunner::new(log.clone()))
    } else {
        Arc::new(NullContainerRunner::new(log.clone()))
    };

    let mut manager = JobManager::new(registry, Some(cache), store, runner, log.clone())
        .context("building job manager")?;
    manager.register_handler(
        HandlerId::new("default"),
        Box::new(DefaultJobHandler::new(
            log.clone(),
            Box::new(functions::dispatcher()),
        )),
    );

    let job_id = manager.submit(SubmitJob {
        function_name: function.clone(),
        function_version: config.version.clone(),
        code: FunctionCode::Local {
            name: function.clone(),
            version: config.version.clone(),
        },
        label: function.clone(),
        kwargs,
        container,
        job_timeout: None,
        flags: JobFlags::default(),
        handler_id: HandlerId::new("default"),
    });

    info!(log, "submitted job"; "job_id" => job_id.as_str(), "function" => %function);

    let timeout = config.timeout_secs.map(Duration::from_secs);
    match manager.wait(&job_id, timeout, true)? {
        WaitOutcome::Finished(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        WaitOutcome::Errored(message) => {
            eprintln!("job {job_id}: {message}");
            Ok(ExitCode::FAILURE)
        }
        WaitOutcome::TimedOut => {
            eprintln!("job {job_id}: timed out");
            Ok(ExitCode::FAILURE)
        }
    }
}
