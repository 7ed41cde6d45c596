use anyhow::{Context, Result};
use clap::Parser;
use hither_container::{MemoizingContainerRunner, ProcessContainerRunner};
use hither_feed::LocalFeed;
use hither_store::LocalContentStore;
use hither_util::config::{base_directories, default_data_dir};
use hither_util::{root_logger, LogLevel};
use slog::info;
use std::process;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Standalone compute resource process. Accepts job handler connections over a feed and runs
/// their jobs on a shared worker pool.
#[derive(Parser, Debug)]
#[command(name = "hither-broker")]
struct Config {
    /// Minimum severity of log messages to print.
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Number of jobs the shared worker pool runs at once.
    #[arg(long, default_value_t = num_cpus::get())]
    num_workers: usize,
}

fn main() -> Result<()> {
    if let Some(job_dir) = hither_parallel::worker_job_dir() {
        return Runtime::new()
            .context("starting worker runtime")?
            .block_on(hither_parallel::worker_main(&job_dir));
    }

    let base_directories =
        base_directories("hither/broker").context("resolving XDG base directories")?;
    let data_dir = default_data_dir(&base_directories).context("resolving data directory")?;
    let config = Config::parse();
    let log = root_logger(config.log_level);

    Runtime::new()
        .context("starting tokio runtime")?
        .block_on(async {
            let feed = Arc::new(LocalFeed::new());
            let store = Arc::new(
                LocalContentStore::new(data_dir.join("blobs"))
                    .await
                    .context("opening content store")?,
            );
            let runner = Arc::new(MemoizingContainerRunner::new(ProcessContainerRunner::new(
                log.clone(),
            )));

            info!(log, "started";
                "config" => ?config,
                "data_dir" => %data_dir.display(),
                "pid" => process::id());

            hither_broker::run(feed, store, runner, config.num_workers, log.clone(), async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

            info!(log, "exiting");
            Ok(())
        })
}
