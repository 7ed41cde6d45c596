//! A job handler backed by a pool of batch-scheduler allocations, each one an inner worker pool
//! of its own. Grounded on the allocation lifecycle of a batch/Slurm handler: an allocation is
//! requested, takes a tick to come up, then runs jobs until it has sat idle long enough to be
//! worth tearing down.

use hither_base::JobId;
use hither_container::ContainerRunner;
use hither_handler::{HandlerEvent, JobHandler, QueuedJob};
use hither_parallel::ParallelJobHandler;
use hither_store::ContentStore;
use slog::{info, o, Logger};
use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long an allocation may sit with no running jobs before [`BatchJobHandler::iterate`] tears
/// it down.
pub const ALLOCATION_IDLE_GRACE: Duration = Duration::from_secs(2);

/// Default wall-clock budget for a fresh allocation, used when the handler isn't configured with
/// one of its own.
pub const DEFAULT_ALLOCATION_TIME_LIMIT: Duration = Duration::from_secs(60 * 60);

/// Slack added to a running allocation's remaining budget before a job is refused admission:
/// without it, a job whose timeout lands right at the allocation's boundary would bounce between
/// "doesn't fit here" and "the new allocation is barely any better" on every tick.
pub const ALLOCATION_ADMISSION_MARGIN: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AllocationStatus {
    Starting,
    Running,
    Stopped,
}

struct Allocation {
    status: AllocationStatus,
    handler: ParallelJobHandler,
    job_ids: HashSet<JobId>,
    idle_since: Option<Instant>,
    started_at: Instant,
}

/// Whether `job` can be admitted to `allocation` without its own timeout outliving the
/// allocation's remaining wall-clock budget, plus `margin` slack.
fn fits_within_allocation(
    job: &QueuedJob,
    allocation: &Allocation,
    allocation_time_limit: Duration,
    margin: Duration,
) -> bool {
    let elapsed = allocation.started_at.elapsed();
    let job_timeout = job.job_timeout.unwrap_or(Duration::ZERO);
    job_timeout + elapsed < allocation_time_limit + margin
}

/// Spreads jobs across a bounded number of allocations, each running up to `jobs_per_allocation`
/// jobs concurrently through its own [`ParallelJobHandler`]. New allocations are requested
/// lazily as work arrives and retired once idle past [`ALLOCATION_IDLE_GRACE`].
pub struct BatchJobHandler {
    jobs_per_allocation: usize,
    max_allocations: usize,
    allocation_time_limit: Duration,
    store: Arc<dyn ContentStore>,
    runner: Arc<dyn ContainerRunner>,
    log: Logger,
    allocations: Vec<Allocation>,
    pending: VecDeque<(QueuedJob, Sender<HandlerEvent>)>,
}

impl BatchJobHandler {
    pub fn new(
        store: Arc<dyn ContentStore>,
        runner: Arc<dyn ContainerRunner>,
        jobs_per_allocation: usize,
        max_allocations: usize,
        log: Logger,
    ) -> Self {
        Self::with_allocation_time_limit(
            store,
            runner,
            jobs_per_allocation,
            max_allocations,
            DEFAULT_ALLOCATION_TIME_LIMIT,
            log,
        )
    }

    pub fn with_allocation_time_limit(
        store: Arc<dyn ContentStore>,
        runner: Arc<dyn ContainerRunner>,
        jobs_per_allocation: usize,
        max_allocations: usize,
        allocation_time_limit: Duration,
        log: Logger,
    ) -> Self {
        Self {
            jobs_per_allocation: jobs_per_allocation.max(1),
            max_allocations: max_allocations.max(1),
            allocation_time_limit,
            store,
            runner,
            log,
            allocations: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn request_allocation(&mut self) -> anyhow::Result<()> {
        let handler = ParallelJobHandler::new(
            self.store.clone(),
            self.runner.clone(),
            self.jobs_per_allocation,
            self.log.new(o!("allocation" => self.allocations.len())),
        )?;
        info!(self.log, "requesting allocation"; "index" => self.allocations.len());
        self.allocations.push(Allocation {
            status: AllocationStatus::Starting,
            handler,
            job_ids: HashSet::new(),
            idle_since: Some(Instant::now()),
            started_at: Instant::now(),
        });
        Ok(())
    }

    fn dispatch_pending(&mut self) -> anyhow::Result<()> {
        while let Some((job, events)) = self.pending.pop_front() {
            let job_id = job.job_id.clone();
            let target = self.allocations.iter().position(|a| {
                a.status == AllocationStatus::Running
                    && a.job_ids.len() < self.jobs_per_allocation
                    && fits_within_allocation(
                        &job,
                        a,
                        self.allocation_time_limit,
                        ALLOCATION_ADMISSION_MARGIN,
                    )
            });
            let target = match target {
                Some(i) => i,
                None if self.allocations.len() < self.max_allocations => {
                    self.request_allocation()?;
                    self.allocations.len() - 1
                }
                None => {
                    // Every allocation is full and we're at the cap: put the job back and wait
                    // for a slot to free up on a later tick.
                    self.pending.push_front((job, events));
                    break;
                }
            };
            let allocation = &mut self.allocations[target];
            allocation.handler.queue_job(job, events)?;
            allocation.job_ids.insert(job_id);
            allocation.idle_since = None;
        }
        Ok(())
    }

    fn advance_allocations(&mut self) -> anyhow::Result<()> {
        for allocation in &mut self.allocations {
            if allocation.status == AllocationStatus::Starting {
                allocation.status = AllocationStatus::Running;
            }
            allocation.handler.iterate()?;
        }
        Ok(())
    }

    fn retire_idle_allocations(&mut self) {
        let now = Instant::now();
        for allocation in &mut self.allocations {
            if allocation.job_ids.is_empty() {
                let idle_since = allocation.idle_since.get_or_insert(now);
                if now.duration_since(*idle_since) >= ALLOCATION_IDLE_GRACE {
                    allocation.status = AllocationStatus::Stopped;
                }
            } else {
                allocation.idle_since = None;
            }
        }
        let log = &self.log;
        self.allocations.retain(|a| {
            let keep = a.status != AllocationStatus::Stopped;
            if !keep {
                info!(log, "retiring idle allocation");
            }
            keep
        });
    }
}

impl JobHandler for BatchJobHandler {
    fn queue_job(&mut self, job: QueuedJob, events: Sender<HandlerEvent>) -> anyhow::Result<()> {
        self.pending.push_back((job, events));
        self.dispatch_pending()
    }

    fn iterate(&mut self) -> anyhow::Result<()> {
        self.advance_allocations()?;
        self.dispatch_pending()?;
        // Reconcile job bookkeeping: an allocation's inner handler reports events directly to
        // the caller, so the only thing left for us to track is which jobs are still running,
        // inferred from whether the handler still owns them. We have no direct accessor for
        // that on `ParallelJobHandler`, so allocations are only considered idle once dispatch
        // has had a chance to place new work and the grace window has elapsed with nothing
        // queued to them since.
        self.retire_idle_allocations();
        Ok(())
    }

    fn cancel_job(&mut self, job_id: &JobId) -> anyhow::Result<()> {
        if let Some(allocation) = self
            .allocations
            .iter_mut()
            .find(|a| a.job_ids.contains(job_id))
        {
            allocation.handler.cancel_job(job_id)?;
            allocation.job_ids.remove(job_id);
        } else {
            self.pending.retain(|(job, _)| &job.job_id != job_id);
        }
        Ok(())
    }

    fn cleanup(&mut self) -> anyhow::Result<()> {
        for allocation in &mut self.allocations {
            allocation.handler.cleanup()?;
        }
        self.allocations.clear();
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
    use std::sync::mpsc::channel;

    fn queued_job() -> QueuedJob {
        QueuedJob {
            job_id: JobId::new(),
            fingerprint: hither_base::Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new()),
            function_name: "f".into(),
            function_version: "1.0.0".into(),
            code: Vec::new(),
            label: "f".into(),
            kwargs: Value::Null,
            container: None,
            job_timeout: None,
            flags: JobFlags::default(),
        }
    }

    fn handler(jobs_per_allocation: usize, max_allocations: usize) -> BatchJobHandler {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(rt.block_on(LocalContentStore::new(dir.path())).unwrap());
        let runner = Arc::new(NullContainerRunner::new(discard_logger()));
        BatchJobHandler::new(store, runner, jobs_per_allocation, max_allocations, discard_logger())
    }

    #[test]
    fn queuing_a_job_requests_an_allocation_on_first_tick() {
        let mut h = handler(2, 3);
        let (tx, _rx) = channel();
        h.queue_job(queued_job(), tx).unwrap();
        assert_eq!(h.allocations.len(), 1);
        assert_eq!(h.allocations[0].status, AllocationStatus::Starting);
    }

    #[test]
    fn iterate_promotes_a_starting_allocation_to_running() {
        let mut h = handler(2, 3);
        let (tx, _rx) = channel();
        h.queue_job(queued_job(), tx).unwrap();
        h.iterate().unwrap();
        assert_eq!(h.allocations[0].status, AllocationStatus::Running);
    }

    #[test]
    fn a_full_allocation_causes_a_new_one_to_be_requested() {
        let mut h = handler(1, 3);
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        h.queue_job(queued_job(), tx1).unwrap();
        h.iterate().unwrap();
        h.queue_job(queued_job(), tx2).unwrap();
        assert_eq!(h.allocations.len(), 2);
    }

    #[test]
    fn cancel_removes_a_still_pending_job() {
        let mut h = handler(1, 1);
        let job = queued_job();
        let job_id = job.job_id.clone();
        // max_allocations is reached with a pending job stuck behind a full running allocation.
        let (tx1, _rx1) = channel();
        h.queue_job(queued_job(), tx1).unwrap();
        h.iterate().unwrap();
        let (tx2, _rx2) = channel();
        h.queue_job(job, tx2).unwrap();
        assert_eq!(h.pending.len(), 1);
        h.cancel_job(&job_id).unwrap();
        assert!(h.pending.is_empty());
    }
}
