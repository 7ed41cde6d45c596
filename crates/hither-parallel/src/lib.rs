//! A job handler backed by a fixed-size pool of worker processes. Each worker is this same
//! binary, re-executed with `--hither-worker` against a per-job directory holding a
//! `request.json`; see [`worker_main`]. A worker is run through [`ContainerRunner::run`] rather
//! than spawned by hand, so the same code path covers both containerized and uncontainerized
//! jobs and enforces the job's timeout and console capture itself -- a dedicated monitor thread
//! per worker owns a throwaway tokio runtime to drive that call, so [`JobHandler::iterate`],
//! which must never block, only ever does a non-blocking `try_recv` on that thread's result
//! channel.

mod protocol;
mod worker;

pub use protocol::{WorkerRequest, WorkerResponse};
pub use worker::{worker_job_dir, worker_main, WORKER_FLAG};

use hither_base::{HitherError, JobId, RuntimeInfo};
use hither_container::{BindMount, ContainerRunner};
use hither_handler::{HandlerEvent, JobHandler, QueuedJob};
use hither_store::ContentStore;
use slog::{o, warn, Logger};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

/// Timeout applied to a job with no `job_timeout` of its own.
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

enum Selected {
    Ran(anyhow::Result<hither_container::RunOutcome>),
    Cancelled,
}

enum WorkerOutcome {
    Response(WorkerResponse, RuntimeInfo),
    TimedOut(RuntimeInfo),
    Canceled(RuntimeInfo),
    Died(RuntimeInfo),
}

struct RunningWorker {
    outcome_rx: Receiver<WorkerOutcome>,
    cancel_tx: Option<tokio::sync::oneshot::Sender<()>>,
    timeout: Duration,
    /// Kept alive until the job finishes; removed from disk on drop.
    _job_dir: TempDir,
}

/// Executes jobs on a bounded pool of worker processes. Containerized and uncontainerized jobs
/// both run through the same [`ContainerRunner::run`] call, the only difference being whether an
/// image is attached; the runner decides how (or whether) to shell out to a container engine.
pub struct ParallelJobHandler {
    store: Arc<dyn ContentStore>,
    runner: Arc<dyn ContainerRunner>,
    num_workers: usize,
    log: Logger,
    pending: VecDeque<(QueuedJob, Sender<HandlerEvent>)>,
    running: HashMap<JobId, (RunningWorker, Sender<HandlerEvent>)>,
    /// Drives the handful of async container-preparation calls this otherwise fully
    /// synchronous handler needs to make; never used to run a job itself.
    bridge: tokio::runtime::Runtime,
}

impl ParallelJobHandler {
    pub fn new(
        store: Arc<dyn ContentStore>,
        runner: Arc<dyn ContainerRunner>,
        num_workers: usize,
        log: Logger,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            runner,
            num_workers,
            log,
            pending: VecDeque::new(),
            running: HashMap::new(),
            bridge: tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?,
        })
    }

    fn spawn_next_if_capacity(&mut self) -> anyhow::Result<()> {
        while self.running.len() < self.num_workers {
            let Some((job, events)) = self.pending.pop_front() else {
                return Ok(());
            };
            let job_id = job.job_id.clone();
            match self.spawn_worker(&job) {
                Ok(worker) => {
                    let _ = events.send(HandlerEvent::Started {
                        job_id: job_id.clone(),
                    });
                    self.running.insert(job_id, (worker, events));
                }
                Err(e) => {
                    let _ = events.send(HandlerEvent::Errored {
                        job_id,
                        error_message: format!("failed to start worker: {e}"),
                        runtime_info: Default::default(),
                    });
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, job: &QueuedJob) -> anyhow::Result<RunningWorker> {
        let job_dir = tempfile::Builder::new().prefix("hither-worker-").tempdir()?;
        let request = WorkerRequest {
            job_id: job.job_id.clone(),
            function_name: job.function_name.clone(),
            function_version: job.function_version.clone(),
            kwargs: job.kwargs.clone(),
        };
        std::fs::write(
            job_dir.path().join(worker::REQUEST_FILE),
            serde_json::to_vec(&request)?,
        )?;

        if let Some(image) = &job.container {
            self.bridge.block_on(self.runner.prepare(image))?;
        }

        let exe = std::env::current_exe()?;
        let exe_dir = exe
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let job_dir_path = job_dir.path().to_path_buf();
        let command = vec![
            exe.display().to_string(),
            WORKER_FLAG.to_string(),
            job_dir_path.display().to_string(),
        ];
        let bind_mounts = vec![
            BindMount {
                host_path: job_dir_path.clone(),
                container_path: job_dir_path.clone(),
            },
            BindMount {
                host_path: exe_dir.clone(),
                container_path: exe_dir,
            },
        ];

        let (tx, rx) = channel();
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        let runner = self.runner.clone();
        let image = job.container.clone();
        let timeout = job.job_timeout.unwrap_or(DEFAULT_JOB_TIMEOUT);
        let log = self.log.new(o!("job_id" => job.job_id.to_string()));
        let thread_job_dir = job_dir_path.clone();

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(log, "failed to start worker monitor runtime"; "error" => %e);
                    let _ = tx.send(WorkerOutcome::Died(RuntimeInfo::default()));
                    return;
                }
            };

            let start_ms = unix_ms_now();
            let selected = rt.block_on(async {
                tokio::select! {
                    result = runner.run(&thread_job_dir, image.as_ref(), &command, &bind_mounts, timeout) => {
                        Selected::Ran(result)
                    }
                    _ = cancel_rx => Selected::Cancelled,
                }
            });
            let finish_ms = unix_ms_now();

            let mut runtime_info = RuntimeInfo::started_now(start_ms);
            let outcome = match selected {
                Selected::Cancelled => {
                    runtime_info.mark_canceled();
                    runtime_info.finish(finish_ms, None);
                    WorkerOutcome::Canceled(runtime_info)
                }
                Selected::Ran(Ok(run_outcome)) => {
                    for line in run_outcome.stdout.lines().chain(run_outcome.stderr.lines()) {
                        runtime_info.push_line(finish_ms, line);
                    }
                    runtime_info.finish(finish_ms, run_outcome.exit_code);
                    if run_outcome.timed_out {
                        WorkerOutcome::TimedOut(runtime_info)
                    } else {
                        match std::fs::read(thread_job_dir.join(worker::RESPONSE_FILE))
                            .ok()
                            .and_then(|bytes| serde_json::from_slice::<WorkerResponse>(&bytes).ok())
                        {
                            Some(response) => WorkerOutcome::Response(response, runtime_info),
                            None => {
                                warn!(log, "worker exited without writing a parseable response");
                                WorkerOutcome::Died(runtime_info)
                            }
                        }
                    }
                }
                Selected::Ran(Err(e)) => {
                    warn!(log, "failed to run worker"; "error" => %e);
                    runtime_info.finish(finish_ms, None);
                    WorkerOutcome::Died(runtime_info)
                }
            };
            let _ = tx.send(outcome);
        });

        Ok(RunningWorker {
            outcome_rx: rx,
            cancel_tx: Some(cancel_tx),
            timeout,
            _job_dir: job_dir,
        })
    }

    fn poll_running(&mut self) {
        let mut finished = Vec::new();
        for (job_id, (worker, events)) in self.running.iter_mut() {
            match worker.outcome_rx.try_recv() {
                Ok(WorkerOutcome::Response(response, runtime_info)) => {
                    match response {
                        WorkerResponse::Finished { result } => {
                            let _ = events.send(HandlerEvent::Finished {
                                job_id: job_id.clone(),
                                result,
                                runtime_info,
                            });
                        }
                        WorkerResponse::Errored { message } => {
                            let _ = events.send(HandlerEvent::Errored {
                                job_id: job_id.clone(),
                                error_message: message,
                                runtime_info,
                            });
                        }
                    }
                    finished.push(job_id.clone());
                }
                Ok(WorkerOutcome::TimedOut(runtime_info)) => {
                    let _ = events.send(HandlerEvent::Errored {
                        job_id: job_id.clone(),
                        error_message: HitherError::Timeout(worker.timeout).to_string(),
                        runtime_info,
                    });
                    finished.push(job_id.clone());
                }
                Ok(WorkerOutcome::Canceled(_runtime_info)) => {
                    let _ = events.send(HandlerEvent::Canceled {
                        job_id: job_id.clone(),
                    });
                    finished.push(job_id.clone());
                }
                Ok(WorkerOutcome::Died(runtime_info)) => {
                    let _ = events.send(HandlerEvent::Errored {
                        job_id: job_id.clone(),
                        error_message: HitherError::WorkerDied.to_string(),
                        runtime_info,
                    });
                    finished.push(job_id.clone());
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => finished.push(job_id.clone()),
            }
        }
        for job_id in finished {
            self.running.remove(&job_id);
        }
    }
}

fn unix_ms_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl JobHandler for ParallelJobHandler {
    fn queue_job(&mut self, job: QueuedJob, events: Sender<HandlerEvent>) -> anyhow::Result<()> {
        self.pending.push_back((job, events));
        self.spawn_next_if_capacity()
    }

    fn iterate(&mut self) -> anyhow::Result<()> {
        self.poll_running();
        self.spawn_next_if_capacity()
    }

    fn cancel_job(&mut self, job_id: &JobId) -> anyhow::Result<()> {
        if let Some((worker, _)) = self.running.get_mut(job_id) {
            if let Some(cancel_tx) = worker.cancel_tx.take() {
                let _ = cancel_tx.send(());
            }
        } else {
            self.pending.retain(|(job, _)| &job.job_id != job_id);
        }
        Ok(())
    }

    fn cleanup(&mut self) -> anyhow::Result<()> {
        for (_, (worker, _)) in self.running.drain() {
            if let Some(cancel_tx) = worker.cancel_tx {
                let _ = cancel_tx.send(());
            }
        }
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hither_base::{JobFlags, Value};
    use hither_container::NullContainerRunner;
    use hither_store::LocalContentStore;
    use hither_util::discard_logger;
    use std::sync::Arc;

    fn queued_job(kwargs: Value) -> QueuedJob {
        QueuedJob {
            job_id: JobId::new(),
            fingerprint: hither_base::Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new()),
            function_name: "double".into(),
            function_version: "1.0.0".into(),
            code: Vec::new(),
            label: "double".into(),
            kwargs,
            container: None,
            job_timeout: None,
            flags: JobFlags::default(),
        }
    }

    #[test]
    fn cancel_on_a_still_pending_job_removes_it_from_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(block_on_new_store(dir.path()));
        let runner = Arc::new(NullContainerRunner::new(discard_logger()));
        let mut handler = ParallelJobHandler::new(store, runner, 0, discard_logger()).unwrap();

        let job = queued_job(Value::Int(1));
        let job_id = job.job_id.clone();
        let (tx, _rx) = channel();
        handler.queue_job(job, tx).unwrap();
        assert_eq!(handler.pending.len(), 1);

        handler.cancel_job(&job_id).unwrap();
        assert!(handler.pending.is_empty());
    }

    fn block_on_new_store(path: &std::path::Path) -> LocalContentStore {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(LocalContentStore::new(path)).unwrap()
    }
}
