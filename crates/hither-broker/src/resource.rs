//! The shared state and two task loops (`registry_task`, `handler_connection_task`) a compute
//! resource is built from. Grounded on `meticulous-broker::lib.rs`'s parent-loop/per-connection
//! split and on the Python source's `ComputeResource`/`JobHandlerConnection` pair, adapted from TCP
//! sockets to feed subfeeds: a handler announces itself on the shared registry subfeed, gets a
//! private reply subfeed, and from then on the two sides talk entirely through appends.

use crate::result_policy::is_small_enough_to_inline;
use hither_base::{
    ContainerImage, FunctionCode, Fingerprint, HandlerToResource, HandlerUri, JobFlags, JobId,
    JobResult, JobSpec, RegistryMessage, ResourceToHandler, RuntimeInfo, Value,
};
use hither_container::ContainerRunner;
use hither_feed::{Feed, Subfeed, SubfeedKey};
use hither_handler::{HandlerEvent, JobHandler, QueuedJob};
use hither_parallel::ParallelJobHandler;
use hither_store::ContentStore;
use hither_util::AdaptivePoller;
use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;

/// How long a connected handler may go without `REPORT_ALIVE` (or any other message) before
/// `handler_connection_task` drops it.
pub const HANDLER_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the tick loop services the inner worker pool. Tighter than a handler's own poll
/// cadence since this drives every job on the resource, not just one handler's.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// The terminal (or started) state of one fingerprint's execution, broadcast to every handler
/// that asked for it while it was in flight and persisted to the fingerprint's memoization
/// subfeed once it finishes, so a later, unrelated handler asking for the same fingerprint gets
/// the cached answer instead of re-running it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JobOutcome {
    Started,
    Finished {
        result: Value,
        runtime_info: RuntimeInfo,
    },
    Errored {
        error_message: String,
        runtime_info: RuntimeInfo,
    },
}

struct RunningJob {
    outcome: watch::Sender<Option<JobOutcome>>,
}

/// Owns the single inner worker pool a compute resource runs every handler's jobs on, plus the
/// fingerprint deduplication table that gives the "one active execution per fingerprint"
/// invariant its teeth: the lock guarding it is only ever held across a check-then-insert, never
/// across a job's actual execution.
pub struct ResourceJobManager {
    feed: Arc<dyn Feed>,
    store: Arc<dyn ContentStore>,
    handler: StdMutex<ParallelJobHandler>,
    running: StdMutex<HashMap<Fingerprint, Arc<RunningJob>>>,
    job_fingerprints: StdMutex<HashMap<JobId, Fingerprint>>,
    /// Resource-internal job id a connection's own `AddJob` actually started running under, so a
    /// later `CANCEL_JOB` from that same connection can find it. Fan-in requests (a job this
    /// connection didn't originate) are not cancellable through this map by design: only the
    /// execution's owner can cancel it.
    owned: StdMutex<HashMap<(HandlerUri, JobId), JobId>>,
    events_tx: std::sync::mpsc::Sender<HandlerEvent>,
    log: Logger,
}

impl ResourceJobManager {
    pub fn spawn(
        feed: Arc<dyn Feed>,
        store: Arc<dyn ContentStore>,
        runner: Arc<dyn ContainerRunner>,
        num_workers: usize,
        log: Logger,
    ) -> anyhow::Result<Arc<Self>> {
        let (events_tx, events_rx) = std::sync::mpsc::channel();
        let handler = ParallelJobHandler::new(
            store.clone(),
            runner,
            num_workers,
            log.new(o!("component" => "pool")),
        )?;
        let manager = Arc::new(Self {
            feed,
            store,
            handler: StdMutex::new(handler),
            running: StdMutex::new(HashMap::new()),
            job_fingerprints: StdMutex::new(HashMap::new()),
            owned: StdMutex::new(HashMap::new()),
            events_tx,
            log,
        });
        let tick_manager = manager.clone();
        tokio::spawn(async move { tick_manager.tick_loop(events_rx).await });
        Ok(manager)
    }

    async fn tick_loop(self: Arc<Self>, events_rx: std::sync::mpsc::Receiver<HandlerEvent>) {
        loop {
            sleep(TICK_INTERVAL).await;
            {
                let mut handler = self.handler.lock().expect("pool mutex poisoned");
                if let Err(e) = handler.iterate() {
                    warn!(self.log, "worker pool iterate failed"; "error" => %e);
                }
            }
            while let Ok(event) = events_rx.try_recv() {
                if let Err(e) = self.handle_event(event).await {
                    warn!(self.log, "error handling a worker pool event"; "error" => %e);
                }
            }
        }
    }

    async fn handle_event(&self, event: HandlerEvent) -> anyhow::Result<()> {
        match event {
            HandlerEvent::Started { job_id } => {
                if let Some(running) = self.running_for(&job_id) {
                    let _ = running.outcome.send(Some(JobOutcome::Started));
                }
            }
            HandlerEvent::Finished {
                job_id,
                result,
                runtime_info,
            } => {
                if let Some(fingerprint) = self.take_job_fingerprint(&job_id) {
                    let outcome = JobOutcome::Finished { result, runtime_info };
                    self.resolve(&fingerprint, outcome).await?;
                }
            }
            HandlerEvent::Errored {
                job_id,
                error_message,
                runtime_info,
            } => {
                if let Some(fingerprint) = self.take_job_fingerprint(&job_id) {
                    let outcome = JobOutcome::Errored {
                        error_message,
                        runtime_info,
                    };
                    self.resolve(&fingerprint, outcome).await?;
                }
            }
            HandlerEvent::Canceled { job_id } => {
                // A cancellation never enters the memoization subfeed: a canceled job was never
                // actually finished, so there is nothing valid to remember for later handlers.
                let _ = self.take_job_fingerprint(&job_id);
            }
        }
        Ok(())
    }

    fn running_for(&self, job_id: &JobId) -> Option<Arc<RunningJob>> {
        let fingerprint = self
            .job_fingerprints
            .lock()
            .expect("fingerprint map poisoned")
            .get(job_id)
            .cloned()?;
        self.running
            .lock()
            .expect("running map poisoned")
            .get(&fingerprint)
            .cloned()
    }

    fn take_job_fingerprint(&self, job_id: &JobId) -> Option<Fingerprint> {
        self.job_fingerprints
            .lock()
            .expect("fingerprint map poisoned")
            .remove(job_id)
    }

    async fn resolve(&self, fingerprint: &Fingerprint, outcome: JobOutcome) -> anyhow::Result<()> {
        if let Some(running) = self
            .running
            .lock()
            .expect("running map poisoned")
            .remove(fingerprint)
        {
            let _ = running.outcome.send(Some(outcome.clone()));
        }
        let memo = self.memo_subfeed(fingerprint).await?;
        memo.append(serde_json::to_value(outcome)?).await?;
        Ok(())
    }

    async fn memo_subfeed(&self, fingerprint: &Fingerprint) -> anyhow::Result<Arc<dyn Subfeed>> {
        self.feed
            .subfeed(SubfeedKey::Name(format!("memo-{}", fingerprint.to_hex())))
            .await
    }

    /// Accepts one `ADD_JOB` from a connected handler: returns its answer on the memoization
    /// subfeed if the fingerprint has already completed, joins an in-flight execution of the
    /// same fingerprint if one exists, or starts a fresh one on the shared worker pool.
    #[allow(clippy::too_many_arguments)]
    async fn accept_job(
        self: &Arc<Self>,
        handler_uri: &HandlerUri,
        handler_job_id: JobId,
        function_name: String,
        function_version: String,
        kwargs: Value,
        container: Option<ContainerImage>,
        job_timeout: Option<Duration>,
        flags: JobFlags,
        inbound: Arc<dyn Subfeed>,
    ) -> anyhow::Result<()> {
        let spec = JobSpec {
            job_id: handler_job_id.clone(),
            function_name: function_name.clone(),
            function_version: function_version.clone(),
            code: FunctionCode::Local {
                name: function_name.clone(),
                version: function_version.clone(),
            },
            label: function_name.clone(),
            kwargs: kwargs.clone(),
            container: container.clone(),
            job_timeout,
            flags,
        };
        let fingerprint = spec.fingerprint();

        let memo = self.memo_subfeed(&fingerprint).await?;
        if let Some(raw) = memo.get_next(0, Duration::ZERO).await? {
            let outcome: JobOutcome = serde_json::from_value(raw)?;
            if self.outcome_files_resolvable(&outcome).await {
                self.reply_terminal(&inbound, handler_job_id, outcome).await?;
                return Ok(());
            }
            warn!(
                self.log, "memoized outcome references files no longer in the content store, re-running";
                "fingerprint" => %fingerprint.to_hex(),
            );
        }

        let watch_rx = {
            let mut running = self.running.lock().expect("running map poisoned");
            if let Some(existing) = running.get(&fingerprint) {
                existing.outcome.subscribe()
            } else {
                let resource_job_id = JobId::new();
                let (tx, rx) = watch::channel(None);
                running.insert(fingerprint.clone(), Arc::new(RunningJob { outcome: tx }));
                drop(running);
                self.job_fingerprints
                    .lock()
                    .expect("fingerprint map poisoned")
                    .insert(resource_job_id.clone(), fingerprint.clone());
                self.owned
                    .lock()
                    .expect("owned map poisoned")
                    .insert((handler_uri.clone(), handler_job_id.clone()), resource_job_id.clone());
                let queued = QueuedJob {
                    job_id: resource_job_id,
                    fingerprint,
                    function_name,
                    function_version,
                    code: Vec::new(),
                    label: spec.label,
                    kwargs,
                    container,
                    job_timeout,
                    flags,
                };
                self.handler
                    .lock()
                    .expect("pool mutex poisoned")
                    .queue_job(queued, self.events_tx.clone())?;
                rx
            }
        };

        let manager = self.clone();
        tokio::spawn(async move {
            let log = manager.log.clone();
            if let Err(e) = manager.forward_outcome(inbound, handler_job_id, watch_rx).await {
                warn!(log, "error forwarding job outcome to handler"; "error" => %e);
            }
        });
        Ok(())
    }

    async fn reply_terminal(
        &self,
        inbound: &Arc<dyn Subfeed>,
        handler_job_id: JobId,
        outcome: JobOutcome,
    ) -> anyhow::Result<()> {
        let message = match outcome {
            JobOutcome::Started => return Ok(()),
            JobOutcome::Finished { result, runtime_info } => {
                ResourceToHandler::JobFinished {
                    job_id: handler_job_id,
                    result: self.wire_result(result).await?,
                    runtime_info,
                }
            }
            JobOutcome::Errored {
                error_message,
                runtime_info,
            } => ResourceToHandler::JobError {
                job_id: handler_job_id,
                error_message,
                runtime_info,
            },
        };
        inbound.append(serde_json::to_value(message)?).await?;
        Ok(())
    }

    async fn forward_outcome(
        self: Arc<Self>,
        inbound: Arc<dyn Subfeed>,
        handler_job_id: JobId,
        mut rx: watch::Receiver<Option<JobOutcome>>,
    ) -> anyhow::Result<()> {
        let mut announced_started = false;
        loop {
            let outcome = rx.borrow_and_update().clone();
            match outcome {
                Some(JobOutcome::Started) if !announced_started => {
                    inbound
                        .append(serde_json::to_value(ResourceToHandler::JobStarted {
                            job_id: handler_job_id.clone(),
                        })?)
                        .await?;
                    announced_started = true;
                }
                Some(JobOutcome::Started) => {}
                Some(outcome @ (JobOutcome::Finished { .. } | JobOutcome::Errored { .. })) => {
                    self.reply_terminal(&inbound, handler_job_id, outcome).await?;
                    return Ok(());
                }
                None => {}
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    async fn wire_result(&self, result: Value) -> anyhow::Result<JobResult> {
        if is_small_enough_to_inline(&result) {
            return Ok(JobResult::Inline { value: result });
        }
        let bytes = serde_json::to_vec(&result)?;
        let hash = self.store.put_bytes(&bytes).await?;
        Ok(JobResult::Stored {
            sha1_path: hash.to_string(),
        })
    }

    /// Best-effort check that every file a memoized outcome's result references is still present
    /// in the content store. An `Errored` or `Started` outcome carries no files and always
    /// passes; a `Finished` outcome with a missing blob fails so the caller re-runs instead of
    /// forwarding a result the handler can't actually fetch.
    async fn outcome_files_resolvable(&self, outcome: &JobOutcome) -> bool {
        let JobOutcome::Finished { result, .. } = outcome else {
            return true;
        };
        for file in result.file_refs() {
            if !self.store.exists_local(&file.sha1_path).await {
                return false;
            }
        }
        true
    }

    fn take_owned_job_id(&self, handler_uri: &HandlerUri, handler_job_id: &JobId) -> Option<JobId> {
        self.owned
            .lock()
            .expect("owned map poisoned")
            .remove(&(handler_uri.clone(), handler_job_id.clone()))
    }
}

/// Tails the shared job-handler registry subfeed, spawning one [`handler_connection_task`] per
/// distinct handler that announces itself. Runs until the feed itself errors; callers cancel it
/// by dropping the task (see `hither-broker`'s `run`).
pub async fn registry_task(manager: Arc<ResourceJobManager>) -> anyhow::Result<()> {
    let registry = manager
        .feed
        .subfeed(SubfeedKey::Name("job_handler_registry".into()))
        .await?;
    let mut position = 0u64;
    let mut poller = AdaptivePoller::new();
    loop {
        let delay = poller.next_delay();
        let Some(raw) = registry.get_next(position, delay).await? else {
            continue;
        };
        position += 1;
        poller.note_activity();
        let RegistryMessage::AddJobHandler {
            handler_uri,
            reply_subfeed,
        } = serde_json::from_value(raw)?;
        info!(manager.log, "job handler connected"; "handler_uri" => %handler_uri);
        let manager = manager.clone();
        tokio::spawn(async move {
            let uri = handler_uri.clone();
            if let Err(e) = handler_connection_task(manager.clone(), uri.clone(), reply_subfeed).await {
                warn!(manager.log, "handler connection ended with an error"; "handler_uri" => %uri, "error" => %e);
            }
        });
    }
}

/// Tails one handler's outbound-to-resource subfeed for the lifetime of the connection,
/// demultiplexing by message type and driving `manager`. Returns when the handler reports
/// `JOB_HANDLER_FINISHED`, stops sending `REPORT_ALIVE` for longer than
/// [`HANDLER_KEEPALIVE_TIMEOUT`], or the feed itself errors.
async fn handler_connection_task(
    manager: Arc<ResourceJobManager>,
    handler_uri: HandlerUri,
    reply_subfeed_name: String,
) -> anyhow::Result<()> {
    let outbound = manager
        .feed
        .subfeed(SubfeedKey::Name(format!(
            "handler-{handler_uri}-to-resource"
        )))
        .await?;
    let inbound = manager.feed.subfeed(SubfeedKey::Name(reply_subfeed_name)).await?;
    inbound
        .append(serde_json::to_value(ResourceToHandler::JobHandlerRegistered)?)
        .await?;

    let mut position = 0u64;
    let mut poller = AdaptivePoller::new();
    let mut last_alive = Instant::now();
    loop {
        let delay = poller.next_delay();
        let message = outbound.get_next(position, delay).await?;
        let Some(raw) = message else {
            if last_alive.elapsed() > HANDLER_KEEPALIVE_TIMEOUT {
                warn!(manager.log, "handler missed keepalive, dropping connection"; "handler_uri" => %handler_uri);
                return Ok(());
            }
            continue;
        };
        position += 1;
        poller.note_activity();
        last_alive = Instant::now();

        let parsed: HandlerToResource = serde_json::from_value(raw)?;
        match parsed {
            HandlerToResource::ReportAlive => {}
            HandlerToResource::JobHandlerFinished => {
                info!(manager.log, "handler finished, closing connection"; "handler_uri" => %handler_uri);
                return Ok(());
            }
            HandlerToResource::CancelJob { job_id } => {
                if let Some(resource_job_id) = manager.take_owned_job_id(&handler_uri, &job_id) {
                    let _ = manager
                        .handler
                        .lock()
                        .expect("pool mutex poisoned")
                        .cancel_job(&resource_job_id);
                }
            }
            HandlerToResource::AddJob {
                job_id,
                function_name,
                function_version,
                code_hash: _,
                kwargs,
                container,
                job_timeout_ms,
                flags,
            } => {
                manager
                    .accept_job(
                        &handler_uri,
                        job_id,
                        function_name,
                        function_version,
                        kwargs,
                        container,
                        job_timeout_ms.map(Duration::from_millis),
                        flags,
                        inbound.clone(),
                    )
                    .await?;
            }
        }
    }
}
