//! The uniform interface every execution backend presents to the job manager. The manager never
//! knows whether a given job runs in-process, in a worker pool, on a batch allocation, or on a
//! remote compute resource -- it only ever calls [`JobHandler::queue_job`], ticks the handler
//! with [`JobHandler::iterate`], and listens for [`HandlerEvent`]s on the channel it handed the
//! handler at queue time.
//!
//! This is a "tick function + typed channels" translation of the Python source's coroutine-free
//! cooperative scheduler: a [`Job`][hither_base::JobId] is never shared across
//! the handler boundary by reference, only a self-contained [`QueuedJob`] plus a sender the
//! handler reports back through.

use hither_base::{ContainerImage, Fingerprint, JobFlags, JobId, RuntimeInfo, Value};
use slog::{warn, Logger};
use std::sync::mpsc::Sender;
use std::time::Duration;

/// Everything a handler needs to run one job, with arguments already resolved (no
/// [`Value::JobRef`] reachable in `kwargs`) and cache-eligibility already decided by the manager.
#[derive(Clone, Debug)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub fingerprint: Fingerprint,
    pub function_name: String,
    pub function_version: String,
    pub code: Vec<u8>,
    pub label: String,
    pub kwargs: Value,
    pub container: Option<ContainerImage>,
    pub job_timeout: Option<Duration>,
    pub flags: JobFlags,
}

/// A status change a handler reports back to the manager for one job, sent on the channel given
/// to [`JobHandler::queue_job`].
#[derive(Clone, Debug)]
pub enum HandlerEvent {
    Started { job_id: JobId },
    Finished { job_id: JobId, result: Value, runtime_info: RuntimeInfo },
    Errored { job_id: JobId, error_message: String, runtime_info: RuntimeInfo },
    Canceled { job_id: JobId },
}

/// An execution backend. A handler owns its own concurrency domain entirely: the manager never
/// blocks on it and never spawns anything on its behalf, only calls `iterate` once per manager
/// tick to give it a chance to make progress and emit events.
pub trait JobHandler: Send {
    /// Accepts a job for execution, reporting status changes on `events`. Must not block for
    /// longer than starting the job's own bookkeeping requires; an in-process handler runs the
    /// function eagerly here (the "default" backend below), everything else only *starts* the
    /// job and reports progress from `iterate`.
    fn queue_job(&mut self, job: QueuedJob, events: Sender<HandlerEvent>) -> anyhow::Result<()>;

    /// Gives the handler a chance to make progress: poll worker processes, drain a feed, check
    /// allocation state. Called once per manager tick; must return promptly.
    fn iterate(&mut self) -> anyhow::Result<()>;

    fn cancel_job(&mut self, job_id: &JobId) -> anyhow::Result<()>;

    /// Releases any resources the handler is holding (worker processes, feed subscriptions,
    /// allocations). Called once, when the manager is shutting down or no longer needs this
    /// handler.
    fn cleanup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// True for handlers whose jobs run outside this process (`hither-remote`); the manager uses
    /// this to decide whether a job's files need to be resolved and pushed to a shared content
    /// store before dispatch.
    fn is_remote(&self) -> bool {
        false
    }
}

/// Runs every job synchronously, in-process, the moment it's queued. This is the handler a job
/// gets if nothing else is configured; it has no `iterate` work to do and cannot cancel a job
/// already in flight, since by the time `cancel_job` could be called the call to `queue_job` has
/// already returned.
pub struct DefaultJobHandler {
    log: Logger,
    call: Box<dyn FnMut(&QueuedJob) -> anyhow::Result<Value> + Send>,
}

impl DefaultJobHandler {
    pub fn new(log: Logger, call: Box<dyn FnMut(&QueuedJob) -> anyhow::Result<Value> + Send>) -> Self {
        Self { log, call }
    }
}

impl JobHandler for DefaultJobHandler {
    fn queue_job(&mut self, job: QueuedJob, events: Sender<HandlerEvent>) -> anyhow::Result<()> {
        let job_id = job.job_id.clone();
        let _ = events.send(HandlerEvent::Started {
            job_id: job_id.clone(),
        });
        match (self.call)(&job) {
            Ok(result) => {
                let _ = events.send(HandlerEvent::Finished {
                    job_id,
                    result,
                    runtime_info: RuntimeInfo::default(),
                });
            }
            Err(e) => {
                let _ = events.send(HandlerEvent::Errored {
                    job_id,
                    error_message: e.to_string(),
                    runtime_info: RuntimeInfo::default(),
                });
            }
        }
        Ok(())
    }

    fn iterate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn cancel_job(&mut self, job_id: &JobId) -> anyhow::Result<()> {
        warn!(self.log, "cannot cancel a job on the default handler, it has already run to completion"; "job_id" => job_id.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hither_util::discard_logger;
    use std::sync::mpsc::channel;

    fn queued_job() -> QueuedJob {
        QueuedJob {
            job_id: JobId::new(),
            fingerprint: Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new()),
            function_name: "double".into(),
            function_version: "1.0.0".into(),
            code: Vec::new(),
            label: "double".into(),
            kwargs: Value::Int(21),
            container: None,
            job_timeout: None,
            flags: JobFlags::default(),
        }
    }

    #[test]
    fn default_handler_runs_synchronously_and_reports_started_then_finished() {
        let mut handler = DefaultJobHandler::new(
            discard_logger(),
            Box::new(|job| Ok(Value::Int(job.kwargs.as_int().unwrap() * 2))),
        );
        let (tx, rx) = channel();
        handler.queue_job(queued_job(), tx).unwrap();

        assert_matches!(rx.recv().unwrap(), HandlerEvent::Started { .. });
        match rx.recv().unwrap() {
            HandlerEvent::Finished { result, .. } => assert_eq!(result, Value::Int(42)),
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn default_handler_reports_errored_on_failure() {
        let mut handler = DefaultJobHandler::new(
            discard_logger(),
            Box::new(|_job| Err(anyhow::anyhow!("boom"))),
        );
        let (tx, rx) = channel();
        handler.queue_job(queued_job(), tx).unwrap();

        assert_matches!(rx.recv().unwrap(), HandlerEvent::Started { .. });
        match rx.recv().unwrap() {
            HandlerEvent::Errored { error_message, .. } => assert_eq!(error_message, "boom"),
            other => panic!("expected Errored, got {other:?}"),
        }
    }
}
