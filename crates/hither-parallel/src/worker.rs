//! The body of a worker process: read the job its parent wrote to a per-job directory, run it
//! against this process's own function registry, and write the result back to that same
//! directory before exiting. `hither-broker`'s binary checks [`worker_job_dir`] before anything
//! else in `main` and calls [`worker_main`] instead of starting the server, after registering the
//! same functions it would register for any other mode.
//!
//! This is the Rust rendering of the Python source's parallel worker process: since Rust has no
//! fork-with-closure, a worker is this same binary re-executed with `--hither-worker`, rather
//! than a forked child that inherited the parent's memory. A re-exec shares no open file
//! descriptors with its parent, so the job and its result travel through a directory the parent
//! bind-mounts into any container the worker runs in, rather than over an inherited pipe.

use crate::protocol::{WorkerRequest, WorkerResponse};
use hither_base::default_registry;
use std::path::{Path, PathBuf};

/// The flag a hosting binary checks for before doing anything else in `main`.
pub const WORKER_FLAG: &str = "--hither-worker";

/// Name of the request file a worker reads from its job directory.
pub const REQUEST_FILE: &str = "request.json";
/// Name of the response file a worker writes to its job directory before exiting.
pub const RESPONSE_FILE: &str = "response.json";

/// If this process was re-executed as a worker, the job directory it should run against.
/// `None` means this is an ordinary invocation of the hosting binary.
pub fn worker_job_dir() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    if args.next()?.as_str() != WORKER_FLAG {
        return None;
    }
    args.next().map(PathBuf::from)
}

pub async fn worker_main(job_dir: &Path) -> anyhow::Result<()> {
    let request_bytes = tokio::fs::read(job_dir.join(REQUEST_FILE)).await?;
    let request: WorkerRequest = serde_json::from_slice(&request_bytes)?;

    let registry = default_registry();
    let response = match registry.lookup(&request.function_name, &request.function_version) {
        Some(entry) => match (entry.f)(&request.kwargs) {
            Ok(result) => WorkerResponse::Finished { result },
            Err(e) => WorkerResponse::Errored {
                message: e.to_string(),
            },
        },
        None => WorkerResponse::Errored {
            message: format!(
                "function {}@{} is not registered in this worker",
                request.function_name, request.function_version
            ),
        },
    };

    tokio::fs::write(job_dir.join(RESPONSE_FILE), serde_json::to_vec(&response)?).await?;
    Ok(())
}
