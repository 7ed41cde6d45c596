//! The job and result exchanged with a worker process through its per-job directory. Renders the
//! Python source's `_pjh_run_job` protocol -- send the job, compute, send the result, exit -- as
//! two small serde types written to files rather than pickled tuples sent over a pipe, since the
//! worker runs under [`hither_container::ContainerRunner::run`], which owns the child process
//! end to end and hands back only its captured stdout/stderr once it has already exited.

use hither_base::{JobId, Value};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job_id: JobId,
    pub function_name: String,
    pub function_version: String,
    pub kwargs: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkerResponse {
    Finished { result: Value },
    Errored { message: String },
}
