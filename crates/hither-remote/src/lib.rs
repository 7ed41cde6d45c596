//! Bridges the synchronous [`JobHandler`] contract to a compute resource reachable only through
//! a feed. Registration and per-job messages are appended synchronously, via the same
//! internal-tokio-runtime bridge pattern `hither-parallel` uses for container preparation;
//! `iterate` drains whatever has arrived on the handler's inbound subfeed since the last tick
//! with a zero-timeout poll, so it never blocks the manager's tick.

use hither_base::{
    HandlerToResource, HandlerUri, JobId, JobResult, RegistryMessage, ResourceToHandler,
    Sha256Hex, Value,
};
use hither_feed::{Feed, Subfeed, SubfeedKey};
use hither_handler::{HandlerEvent, JobHandler, QueuedJob};
use hither_store::ContentStore;
use hither_util::AdaptivePoller;
use slog::{info, Logger};
use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often a registered handler re-announces itself so the resource doesn't drop it for
/// looking dead. Must stay comfortably under the resource's own keepalive timeout.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// How long [`RemoteJobHandler::ensure_registered`] waits for `JOB_HANDLER_REGISTERED` before
/// giving up with [`hither_base::HitherError::RegistrationTimeout`].
const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

struct Registration {
    outbound: Arc<dyn Subfeed>,
    inbound: Arc<dyn Subfeed>,
    next_inbound_position: u64,
}

/// A job handler whose jobs actually run on some other process entirely, reached by appending
/// messages to a feed subfeed and tailing the reply. Registration happens lazily, the first time
/// a job is queued, rather than at construction, so building one is infallible even if the
/// resource isn't listening yet.
pub struct RemoteJobHandler {
    feed: Arc<dyn Feed>,
    store: Arc<dyn ContentStore>,
    handler_uri: HandlerUri,
    registration_timeout: Duration,
    log: Logger,
    bridge: tokio::runtime::Runtime,
    registration: Option<Registration>,
    running: HashMap<JobId, Sender<HandlerEvent>>,
    poller: AdaptivePoller,
    last_keepalive: Instant,
}

impl RemoteJobHandler {
    pub fn new(
        feed: Arc<dyn Feed>,
        store: Arc<dyn ContentStore>,
        handler_uri: HandlerUri,
        log: Logger,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            feed,
            store,
            handler_uri,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            log,
            bridge: tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?,
            registration: None,
            running: HashMap::new(),
            poller: AdaptivePoller::new(),
            last_keepalive: Instant::now(),
        })
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// How long a caller driving this handler's `iterate` from a sleep loop should wait before
    /// calling again, given how recently the inbound subfeed actually had something new on it.
    pub fn poll_delay_hint(&self) -> Duration {
        self.poller.next_delay()
    }

    fn ensure_registered(&mut self) -> anyhow::Result<()> {
        if self.registration.is_some() {
            return Ok(());
        }
        let feed = self.feed.clone();
        let handler_uri = self.handler_uri.clone();
        let timeout = self.registration_timeout;
        let log = self.log.clone();
        let registration = self.bridge.block_on(async move {
            let registry = feed
                .subfeed(SubfeedKey::Name("job_handler_registry".into()))
                .await?;
            let outbound = feed
                .subfeed(SubfeedKey::Name(format!(
                    "handler-{handler_uri}-to-resource"
                )))
                .await?;
            let inbound_name = format!("handler-{handler_uri}-from-resource");
            let inbound = feed
                .subfeed(SubfeedKey::Name(inbound_name.clone()))
                .await?;

            info!(log, "registering with compute resource"; "handler_uri" => %handler_uri);
            registry
                .append(serde_json::to_value(RegistryMessage::AddJobHandler {
                    handler_uri: handler_uri.clone(),
                    reply_subfeed: inbound_name,
                })?)
                .await?;

            let deadline = Instant::now() + timeout;
            let mut position = 0u64;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(anyhow::Error::from(
                        hither_base::HitherError::RegistrationTimeout,
                    ));
                }
                let poll_for = remaining.min(Duration::from_millis(200));
                match inbound.get_next(position, poll_for).await? {
                    Some(msg) => {
                        position += 1;
                        let parsed: ResourceToHandler = serde_json::from_value(msg)?;
                        if matches!(parsed, ResourceToHandler::JobHandlerRegistered) {
                            return Ok(Registration {
                                outbound,
                                inbound,
                                next_inbound_position: position,
                            });
                        }
                        // Anything else arriving before registration is unexpected but not
                        // fatal; keep draining in case the resource replays earlier state.
                    }
                    None => continue,
                }
            }
        })?;
        self.registration = Some(registration);
        Ok(())
    }

    fn send_keepalive_if_due(&mut self) -> anyhow::Result<()> {
        if self.last_keepalive.elapsed() < KEEPALIVE_INTERVAL {
            return Ok(());
        }
        if let Some(registration) = &self.registration {
            let message = serde_json::to_value(HandlerToResource::ReportAlive)?;
            self.bridge.block_on(registration.outbound.append(message))?;
            self.last_keepalive = Instant::now();
        }
        Ok(())
    }

    fn drain_inbound(&mut self) -> anyhow::Result<()> {
        loop {
            let Some(registration) = &mut self.registration else {
                return Ok(());
            };
            let next = self.bridge.block_on(
                registration
                    .inbound
                    .get_next(registration.next_inbound_position, Duration::ZERO),
            )?;
            let Some(raw) = next else {
                return Ok(());
            };
            registration.next_inbound_position += 1;
            self.poller.note_activity();
            let message: ResourceToHandler = serde_json::from_value(raw)?;
            self.handle_message(message)?;
        }
    }

    fn handle_message(&mut self, message: ResourceToHandler) -> anyhow::Result<()> {
        match message {
            ResourceToHandler::JobHandlerRegistered | ResourceToHandler::JobQueued { .. } => {}
            ResourceToHandler::JobStarted { job_id } => {
                if let Some(events) = self.running.get(&job_id) {
                    let _ = events.send(HandlerEvent::Started { job_id });
                }
            }
            ResourceToHandler::JobFinished {
                job_id,
                result,
                runtime_info,
            } => {
                if let Some(events) = self.running.remove(&job_id) {
                    let result = self.resolve_result(result)?;
                    let _ = events.send(HandlerEvent::Finished {
                        job_id,
                        result,
                        runtime_info,
                    });
                }
            }
            ResourceToHandler::JobError {
                job_id,
                error_message,
                runtime_info,
            } => {
                if let Some(events) = self.running.remove(&job_id) {
                    let _ = events.send(HandlerEvent::Errored {
                        job_id,
                        error_message,
                        runtime_info,
                    });
                }
            }
        }
        Ok(())
    }

    fn resolve_result(&self, result: JobResult) -> anyhow::Result<Value> {
        match result {
            JobResult::Inline { value } => Ok(value),
            JobResult::Stored { sha1_path } => {
                let hash = Sha256Hex::from(sha1_path);
                let bytes = self.bridge.block_on(self.store.get_bytes(&hash))?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}

impl JobHandler for RemoteJobHandler {
    fn queue_job(&mut self, job: QueuedJob, events: Sender<HandlerEvent>) -> anyhow::Result<()> {
        self.ensure_registered()?;
        let code_hash = self.bridge.block_on(self.store.put_bytes(&job.code))?;
        let registration = self.registration.as_ref().expect("just registered above");
        let message = HandlerToResource::AddJob {
            job_id: job.job_id.clone(),
            function_name: job.function_name.clone(),
            function_version: job.function_version.clone(),
            code_hash,
            kwargs: job.kwargs.clone(),
            container: job.container.clone(),
            job_timeout_ms: job.job_timeout.map(|d| d.as_millis() as u64),
            flags: job.flags,
        };
        self.bridge
            .block_on(registration.outbound.append(serde_json::to_value(message)?))?;
        self.running.insert(job.job_id, events);
        Ok(())
    }

    fn iterate(&mut self) -> anyhow::Result<()> {
        if self.registration.is_none() {
            return Ok(());
        }
        self.drain_inbound()?;
        self.send_keepalive_if_due()
    }

    fn cancel_job(&mut self, job_id: &JobId) -> anyhow::Result<()> {
        if let Some(registration) = &self.registration {
            let message = serde_json::to_value(HandlerToResource::CancelJob {
                job_id: job_id.clone(),
            })?;
            self.bridge.block_on(registration.outbound.append(message))?;
        }
        Ok(())
    }

    fn cleanup(&mut self) -> anyhow::Result<()> {
        if let Some(registration) = &self.registration {
            let message = serde_json::to_value(HandlerToResource::JobHandlerFinished)?;
            let _ = self.bridge.block_on(registration.outbound.append(message));
        }
        self.running.clear();
        Ok(())
    }

    fn is_remote(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hither_base::{Fingerprint, JobFlags};
    use hither_feed::LocalFeedRegistry;
    use hither_store::LocalContentStore;
    use hither_util::discard_logger;
    use std::sync::mpsc::channel;

    fn queued_job(kwargs: Value) -> QueuedJob {
        QueuedJob {
            job_id: JobId::new(),
            fingerprint: Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new()),
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

    fn new_store() -> Arc<LocalContentStore> {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        Arc::new(rt.block_on(LocalContentStore::new(dir.path())).unwrap())
    }

    /// Drives the "compute resource" side of the protocol by hand, enough to exercise
    /// registration, one job round trip, and cancellation without standing up `hither-broker`.
    fn respond_as_resource(registry: &LocalFeedRegistry, handler_uri: &str) {
        let feed = registry.feed();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let registry_sub = feed
                .subfeed(SubfeedKey::Name("job_handler_registry".into()))
                .await
                .unwrap();
            let msg = registry_sub
                .get_next(0, Duration::from_secs(1))
                .await
                .unwrap()
                .expect("handler should have registered");
            let parsed: RegistryMessage = serde_json::from_value(msg).unwrap();
            let RegistryMessage::AddJobHandler { reply_subfeed, .. } = parsed;
            assert_eq!(reply_subfeed, format!("handler-{handler_uri}-from-resource"));
            let inbound = feed.subfeed(SubfeedKey::Name(reply_subfeed)).await.unwrap();
            inbound
                .append(serde_json::to_value(ResourceToHandler::JobHandlerRegistered).unwrap())
                .await
                .unwrap();

            let outbound = feed
                .subfeed(SubfeedKey::Name(format!(
                    "handler-{handler_uri}-to-resource"
                )))
                .await
                .unwrap();
            let add_job = outbound
                .get_next(0, Duration::from_secs(1))
                .await
                .unwrap()
                .expect("handler should have queued a job");
            let parsed: HandlerToResource = serde_json::from_value(add_job).unwrap();
            let HandlerToResource::AddJob { job_id, .. } = parsed else {
                panic!("expected AddJob");
            };
            inbound
                .append(
                    serde_json::to_value(ResourceToHandler::JobFinished {
                        job_id,
                        result: JobResult::Inline {
                            value: Value::Int(84),
                        },
                        runtime_info: Default::default(),
                    })
                    .unwrap(),
                )
                .await
                .unwrap();
        });
    }

    #[test]
    fn a_queued_job_round_trips_through_a_hand_driven_resource() {
        let registry = LocalFeedRegistry::new();
        let feed = Arc::new(registry.feed());
        let store = new_store();
        let mut handler = RemoteJobHandler::new(
            feed,
            store,
            HandlerUri::new("test-handler"),
            discard_logger(),
        )
        .unwrap();

        let (tx, rx) = channel();
        handler.queue_job(queued_job(Value::Int(42)), tx).unwrap();
        respond_as_resource(&registry, "test-handler");

        for _ in 0..50 {
            handler.iterate().unwrap();
            if let Ok(HandlerEvent::Finished { result, .. }) = rx.try_recv() {
                assert_eq!(result, Value::Int(84));
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("never observed a Finished event");
    }
}
