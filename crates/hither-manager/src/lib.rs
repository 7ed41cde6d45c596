//! The job manager: the single-threaded cooperative scheduler that ties a function registry, a
//! job cache, and a set of registered handlers together. Everything above this crate submits a
//! job and polls or waits on its [`hither_base::JobId`]; nothing above it ever talks to a
//! [`hither_handler::JobHandler`] directly. See [`JobManager::tick`] for the four-phase
//! algorithm this is built around.

mod job;

pub use job::{HandlerId, Job, SubmitJob, IDENTITY_FUNCTION_NAME, IDENTITY_FUNCTION_VERSION};

use hither_base::{
    FunctionCode, FunctionRegistry, HitherError, JobFlags, JobId, JobSpec, JobStatus, RuntimeInfo,
    Value,
};
use hither_cache::{CacheLookup, CacheRecord, JobCache};
use hither_container::ContainerRunner;
use hither_handler::{HandlerEvent, JobHandler, QueuedJob};
use hither_store::ContentStore;
use slog::{warn, Logger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// How long the manager sleeps between ticks in [`JobManager::wait`]/[`JobManager::wait_all`],
/// matching the Python source's `time.sleep(0.02)`.
const TICK_SLEEP: Duration = Duration::from_millis(20);

/// What [`JobManager::wait`] returns once the target job (or, for an unresolved remote result,
/// the substitute identity job chained after it) reaches a terminal status, or the timeout
/// elapses first.
#[derive(Clone, Debug)]
pub enum WaitOutcome {
    Finished(Value),
    Errored(String),
    TimedOut,
}

/// Two ordered sets of job IDs (`queued`, `running`), a function registry, an optional job
/// cache, and a table of caller-registered handlers. See the module docs for the tick algorithm;
/// everything else here is bookkeeping to support it and to answer queries about jobs that have
/// already completed.
pub struct JobManager {
    registry: FunctionRegistry,
    cache: Option<Arc<dyn JobCache>>,
    store: Arc<dyn ContentStore>,
    runner: Arc<dyn ContainerRunner>,
    handlers: HashMap<HandlerId, Box<dyn JobHandler>>,
    jobs: HashMap<JobId, Job>,
    queued: Vec<JobId>,
    running: Vec<JobId>,
    completed: Vec<JobId>,
    events_tx: std::sync::mpsc::Sender<HandlerEvent>,
    events_rx: std::sync::mpsc::Receiver<HandlerEvent>,
    /// Drives the async `JobCache`/`ContentStore`/`ContainerRunner` calls a tick needs to make;
    /// the manager itself never spawns anything, matching the "never blocks its caller's own
    /// executor" contract the handler crates already follow.
    bridge: tokio::runtime::Runtime,
    log: Logger,
}

impl JobManager {
    pub fn new(
        registry: FunctionRegistry,
        cache: Option<Arc<dyn JobCache>>,
        store: Arc<dyn ContentStore>,
        runner: Arc<dyn ContainerRunner>,
        log: Logger,
    ) -> anyhow::Result<Self> {
        registry
            .register(
                IDENTITY_FUNCTION_NAME,
                IDENTITY_FUNCTION_VERSION,
                None,
                Arc::new(job::identity),
            )
            .map_err(anyhow::Error::from)?;
        let (events_tx, events_rx) = std::sync::mpsc::channel();
        Ok(Self {
            registry,
            cache,
            store,
            runner,
            handlers: HashMap::new(),
            jobs: HashMap::new(),
            queued: Vec::new(),
            running: Vec::new(),
            completed: Vec::new(),
            events_tx,
            events_rx,
            bridge: tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?,
            log,
        })
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn register_handler(&mut self, handler_id: HandlerId, handler: Box<dyn JobHandler>) {
        self.handlers.insert(handler_id, handler);
    }

    /// Enqueues a new job and returns the ID the caller uses to query or wait on it. Equivalent
    /// to the Python source's `JobManager.queue_job` -- the job starts life already `Queued`,
    /// there being no externally meaningful `Pending` phase once the caller has decided to
    /// submit it.
    pub fn submit(&mut self, req: SubmitJob) -> JobId {
        let job_id = JobId::new();
        let job = Job::new(job_id.clone(), req);
        self.jobs.insert(job_id.clone(), job);
        self.queued.push(job_id.clone());
        job_id
    }

    /// Reconstructs a job from a [`JobSpec`] received over the wire and submits it under
    /// `handler_id`, exactly as a worker, batch allocation, or compute resource re-dispatches a
    /// job it was handed.
    pub fn adopt(&mut self, spec: JobSpec, handler_id: HandlerId) -> JobId {
        let job = Job::deserialize(spec, handler_id);
        let job_id = job.job_id().clone();
        self.jobs.insert(job_id.clone(), job);
        self.queued.push(job_id.clone());
        job_id
    }

    pub fn serialize_job(&self, job_id: &JobId, generate_code: bool) -> hither_base::Result<JobSpec> {
        let job = self.jobs.get(job_id).ok_or_else(|| {
            HitherError::Other(anyhow::anyhow!("no such job: {job_id}"))
        })?;
        job.serialize(generate_code)
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.jobs.get(job_id).map(Job::status)
    }

    pub fn result(&self, job_id: &JobId) -> Option<&Value> {
        self.jobs.get(job_id).and_then(Job::result)
    }

    pub fn error_message(&self, job_id: &JobId) -> Option<&str> {
        self.jobs.get(job_id).and_then(Job::error_message)
    }

    pub fn runtime_info(&self, job_id: &JobId) -> Option<&RuntimeInfo> {
        self.jobs.get(job_id).map(Job::runtime_info)
    }

    /// Drops a completed job's state. The manager never does this on its own -- a job's result
    /// stays queryable by ID until the caller says it's done with it.
    pub fn forget(&mut self, job_id: &JobId) {
        self.jobs.remove(job_id);
        self.completed.retain(|id| id != job_id);
    }

    pub fn cancel(&mut self, job_id: &JobId) -> anyhow::Result<()> {
        let Some(handler_id) = self.jobs.get(job_id).map(|j| j.handler_id().clone()) else {
            return Ok(());
        };
        if let Some(handler) = self.handlers.get_mut(&handler_id) {
            handler.cancel_job(job_id)?;
        }
        Ok(())
    }

    /// Releases every registered handler's resources. Call once, when the manager is being torn
    /// down.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        for handler in self.handlers.values_mut() {
            handler.cleanup()?;
        }
        Ok(())
    }

    /// The four-phase tick: prepare containers, dispatch ready jobs, advance handlers and drain
    /// their events, reap terminal jobs. Called directly by a caller driving its own event loop,
    /// or internally by [`JobManager::wait`]/[`JobManager::wait_all`].
    pub fn tick(&mut self) -> anyhow::Result<()> {
        self.prepare_containers()?;
        self.dispatch()?;
        self.advance_handlers()?;
        self.reap_terminals()?;
        Ok(())
    }

    fn handler_is_remote(&self, handler_id: &HandlerId) -> bool {
        self.handlers
            .get(handler_id)
            .map(|handler| handler.is_remote())
            .unwrap_or(false)
    }

    /// Phase 1: for every still-queued job with a container, bound to a non-remote handler,
    /// ensure the image is prepared. A remote handler's own compute resource prepares containers
    /// on its side; there is nothing for this process to do.
    fn prepare_containers(&mut self) -> anyhow::Result<()> {
        for job_id in self.queued.clone() {
            let Some(job) = self.jobs.get(&job_id) else { continue };
            if job.status() != JobStatus::Queued {
                continue;
            }
            let Some(image) = job.container.clone() else { continue };
            if self.handler_is_remote(job.handler_id()) {
                continue;
            }
            if let Err(e) = self.bridge.block_on(self.runner.prepare(&image)) {
                warn!(self.log, "container preparation failed";
                    "job_id" => job.job_id().as_str(), "image" => image.as_str(), "error" => %e);
                let job = self.jobs.get_mut(&job_id).expect("looked up above");
                job.status = JobStatus::Error;
                job.error_message = Some(format!(
                    "unable to prepare container for job {}: {image}",
                    job.label
                ));
            }
        }
        Ok(())
    }

    /// Phase 2: every job still in `queued` either leaves pending (an unresolved dependency),
    /// errors out (a dependency errored, or container preparation already failed above), or
    /// becomes ready -- in which case its arguments are resolved, the cache is consulted, and
    /// whatever's still `Queued` after that is handed to its handler.
    fn dispatch(&mut self) -> anyhow::Result<()> {
        for job_id in self.queued.clone() {
            let Some(mut job) = self.jobs.get(&job_id).cloned() else { continue };

            if job.status() != JobStatus::Queued {
                self.queued.retain(|id| id != &job_id);
                self.completed.push(job_id.clone());
                self.jobs.insert(job_id, job);
                continue;
            }

            if !self.dependencies_terminal(&job.kwargs) {
                continue;
            }
            self.queued.retain(|id| id != &job_id);

            if let Some(message) = self.dependency_error(&job.kwargs) {
                job.status = JobStatus::Error;
                job.error_message = Some(format!("error in argument job: {message}"));
                self.completed.push(job_id.clone());
                self.jobs.insert(job_id, job);
                continue;
            }

            job.kwargs = self.resolve_kwargs(&job.kwargs);
            self.running.push(job_id.clone());

            if !job.flags.no_resolve_input_files {
                if let Err(e) = self.ensure_input_files_available(&job.kwargs) {
                    job.status = JobStatus::Error;
                    job.error_message = Some(e.to_string());
                    self.jobs.insert(job_id, job);
                    continue;
                }
            }

            let spec = job
                .serialize(false)
                .expect("serialize(false) never fails once code and kwargs are set");
            let fingerprint = spec.fingerprint();
            job.fingerprint = Some(fingerprint);

            let is_remote = self.handler_is_remote(job.handler_id());
            if !is_remote {
                if let Some(cache) = self.cache.clone() {
                    let lookup = self.bridge.block_on(cache.lookup(
                        &fingerprint,
                        &job.flags,
                        self.store.as_ref(),
                    ))?;
                    match lookup {
                        CacheLookup::Hit(CacheRecord::Finished {
                            result,
                            runtime_info,
                        }) => {
                            job.status = JobStatus::Finished;
                            job.result = Some(result);
                            job.runtime_info = runtime_info;
                            job.from_cache = true;
                        }
                        CacheLookup::Hit(CacheRecord::Errored {
                            error_message,
                            runtime_info,
                        }) => {
                            job.status = JobStatus::Error;
                            job.error_message = Some(error_message);
                            job.runtime_info = runtime_info;
                            job.from_cache = true;
                        }
                        CacheLookup::Miss => {}
                    }
                }
            }

            if job.status() == JobStatus::Queued {
                let queued_job = QueuedJob {
                    job_id: job.job_id().clone(),
                    fingerprint,
                    function_name: job.function_name.clone(),
                    function_version: job.function_version.clone(),
                    code: match &job.code {
                        FunctionCode::Transportable(bytes) => bytes.clone(),
                        FunctionCode::Local { .. } => Vec::new(),
                    },
                    label: job.label.clone(),
                    kwargs: job.kwargs.clone(),
                    container: job.container.clone(),
                    job_timeout: job.job_timeout,
                    flags: job.flags,
                };
                if let Some(handler) = self.handlers.get_mut(job.handler_id()) {
                    handler.queue_job(queued_job, self.events_tx.clone())?;
                }
            }

            self.jobs.insert(job_id, job);
        }
        Ok(())
    }

    /// Phase 3: give every handler with a stake in a queued or running job a chance to make
    /// progress, then drain whatever status events they reported.
    fn advance_handlers(&mut self) -> anyhow::Result<()> {
        let mut active = Vec::new();
        for job_id in self.queued.iter().chain(self.running.iter()) {
            if let Some(job) = self.jobs.get(job_id) {
                if !active.contains(job.handler_id()) {
                    active.push(job.handler_id().clone());
                }
            }
        }
        for handler_id in active {
            if let Some(handler) = self.handlers.get_mut(&handler_id) {
                handler.iterate()?;
            }
        }
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply_event(event);
        }
        Ok(())
    }

    fn apply_event(&mut self, event: HandlerEvent) {
        match event {
            HandlerEvent::Started { job_id } => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    if job.status == JobStatus::Queued {
                        job.status = JobStatus::Running;
                    }
                }
            }
            HandlerEvent::Finished {
                job_id,
                result,
                runtime_info,
            } => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Finished;
                    job.result = Some(result);
                    job.runtime_info = runtime_info;
                }
            }
            HandlerEvent::Errored {
                job_id,
                error_message,
                runtime_info,
            } => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Error;
                    job.error_message = Some(error_message);
                    job.runtime_info = runtime_info;
                }
            }
            HandlerEvent::Canceled { job_id } => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Canceled;
                    job.runtime_info.mark_canceled();
                }
            }
        }
    }

    /// Phase 4: every running job that has reached a terminal status is written to the cache
    /// (unless it was itself a cache hit, or is held by a remote handler whose compute resource
    /// already memoized it) and moved out of `running`.
    fn reap_terminals(&mut self) -> anyhow::Result<()> {
        for job_id in self.running.clone() {
            let Some(job) = self.jobs.get(&job_id) else { continue };
            if !job.status().is_terminal() {
                continue;
            }
            let job = job.clone();

            if job.flags.download_results {
                for file_ref in job.result.iter().flat_map(|r| r.file_refs()) {
                    let available = self
                        .bridge
                        .block_on(self.store.exists_local(&file_ref.sha1_path));
                    if !available {
                        warn!(self.log, "result file is not yet locally resolvable";
                            "job_id" => job.job_id().as_str(), "sha1_path" => file_ref.sha1_path.as_str());
                    }
                }
            }

            if !job.from_cache && !self.handler_is_remote(job.handler_id()) {
                if let (Some(cache), Some(fingerprint)) = (self.cache.clone(), job.fingerprint) {
                    match job.status() {
                        JobStatus::Finished => {
                            self.bridge.block_on(cache.record(
                                &fingerprint,
                                CacheRecord::Finished {
                                    result: job.result.clone().unwrap_or(Value::Null),
                                    runtime_info: job.runtime_info.clone(),
                                },
                            ))?;
                        }
                        JobStatus::Error => {
                            self.bridge.block_on(cache.record(
                                &fingerprint,
                                CacheRecord::Errored {
                                    error_message: job.error_message.clone().unwrap_or_default(),
                                    runtime_info: job.runtime_info.clone(),
                                },
                            ))?;
                        }
                        _ => {}
                    }
                }
            }

            self.running.retain(|id| id != &job_id);
            self.completed.push(job_id);
        }
        Ok(())
    }

    fn dependencies_terminal(&self, kwargs: &Value) -> bool {
        kwargs
            .job_refs()
            .into_iter()
            .all(|id| self.jobs.get(id).map(|j| j.status().is_terminal()).unwrap_or(false))
    }

    fn dependency_error(&self, kwargs: &Value) -> Option<String> {
        for job_id in kwargs.job_refs() {
            let Some(dep) = self.jobs.get(job_id) else { continue };
            match dep.status() {
                JobStatus::Error => {
                    return Some(dep.error_message().unwrap_or("unknown error").to_string());
                }
                JobStatus::Canceled => {
                    return Some(format!("dependency job {job_id} was cancelled"));
                }
                _ => {}
            }
        }
        None
    }

    fn resolve_kwargs(&self, value: &Value) -> Value {
        match value {
            Value::JobRef { job_id } => self
                .jobs
                .get(job_id)
                .and_then(Job::result)
                .cloned()
                .unwrap_or(Value::Null),
            Value::List { items } => Value::List {
                items: items.iter().map(|v| self.resolve_kwargs(v)).collect(),
            },
            Value::Tuple { items } => Value::Tuple {
                items: items.iter().map(|v| self.resolve_kwargs(v)).collect(),
            },
            Value::Map { entries } => {
                let mut resolved = hither_base::ValueMap::new();
                for (key, v) in entries.iter() {
                    resolved.insert(key.clone(), self.resolve_kwargs(v));
                }
                Value::Map { entries: resolved }
            }
            other => other.clone(),
        }
    }

    /// Best-effort local-availability check for a job's resolved input files. We have no
    /// cross-store fetch path (the content store is local-only by design, see `hither-store`),
    /// so this can only catch the case where a file a job depends on was never local to begin
    /// with; it cannot reach out to a remote handler to pull one down.
    fn ensure_input_files_available(&self, kwargs: &Value) -> anyhow::Result<()> {
        for file_ref in kwargs.file_refs() {
            let available = self
                .bridge
                .block_on(self.store.exists_local(&file_ref.sha1_path));
            if !available {
                anyhow::bail!("input file {} is not available locally", file_ref.sha1_path);
            }
        }
        Ok(())
    }

    /// Loops [`JobManager::tick`] until both `queued` and `running` are empty, or `timeout`
    /// elapses.
    pub fn wait_all(&mut self, timeout: Option<Duration>) -> anyhow::Result<()> {
        let start = Instant::now();
        loop {
            self.tick()?;
            if self.queued.is_empty() && self.running.is_empty() {
                return Ok(());
            }
            if matches!(timeout, Some(Duration::ZERO)) {
                return Ok(());
            }
            std::thread::sleep(TICK_SLEEP);
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Ok(());
                }
            }
        }
    }

    /// Loops [`JobManager::tick`] until `job_id` reaches a terminal status, or `timeout`
    /// elapses. When `resolve_files` is set and the job's files were left on a remote handler
    /// (no `download_results`), this transparently submits and waits on a substitute identity
    /// job with `download_results: true` instead, the sole mechanism by which file
    /// resolvability is guaranteed after the fact.
    pub fn wait(
        &mut self,
        job_id: &JobId,
        timeout: Option<Duration>,
        resolve_files: bool,
    ) -> anyhow::Result<WaitOutcome> {
        let start = Instant::now();
        let mut target = job_id.clone();
        loop {
            self.tick()?;
            if let Some(job) = self.jobs.get(&target).cloned() {
                match job.status() {
                    JobStatus::Finished => {
                        let result = job.result().cloned().unwrap_or(Value::Null);
                        if resolve_files
                            && self.handler_is_remote(job.handler_id())
                            && !job.flags.download_results
                            && self.needs_remote_file_resolution(&result)
                        {
                            target = self.submit(SubmitJob {
                                function_name: IDENTITY_FUNCTION_NAME.into(),
                                function_version: IDENTITY_FUNCTION_VERSION.into(),
                                code: FunctionCode::Local {
                                    name: IDENTITY_FUNCTION_NAME.into(),
                                    version: IDENTITY_FUNCTION_VERSION.into(),
                                },
                                label: "resolve-remote-files".into(),
                                kwargs: result,
                                container: None,
                                job_timeout: None,
                                flags: JobFlags {
                                    download_results: true,
                                    ..JobFlags::default()
                                },
                                handler_id: job.handler_id().clone(),
                            });
                            continue;
                        }
                        return Ok(WaitOutcome::Finished(result));
                    }
                    JobStatus::Error => {
                        return Ok(WaitOutcome::Errored(
                            job.error_message().unwrap_or("unknown error").to_string(),
                        ));
                    }
                    JobStatus::Canceled => {
                        return Ok(WaitOutcome::Errored("job was cancelled".to_string()));
                    }
                    _ => {}
                }
            }
            if matches!(timeout, Some(Duration::ZERO)) {
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(TICK_SLEEP);
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Ok(WaitOutcome::TimedOut);
                }
            }
        }
    }

    fn needs_remote_file_resolution(&self, result: &Value) -> bool {
        result
            .file_refs()
            .into_iter()
            .any(|f| !self.bridge.block_on(self.store.exists_local(&f.sha1_path)))
    }
}

static DEFAULT_MANAGER: OnceLock<Mutex<JobManager>> = OnceLock::new();

/// A process-wide convenience manager: an in-memory cache, a [`hither_store::LocalContentStore`]
/// under the standard XDG data directory, and a runner that executes uncontainerized jobs
/// directly on the host. Meant for quick scripts and the `hither-run` binary; anything that
/// cares about test isolation should build its own `JobManager` and thread it through
/// explicitly instead of reaching for this.
pub fn default_manager() -> &'static Mutex<JobManager> {
    DEFAULT_MANAGER.get_or_init(|| {
        let base = hither_util::config::base_directories("hither/manager")
            .expect("resolving XDG base directories");
        let data_dir =
            hither_util::config::default_data_dir(&base).expect("resolving default data directory");
        let rt = tokio::runtime::Runtime::new().expect("building a throwaway tokio runtime");
        let store = rt
            .block_on(hither_store::LocalContentStore::new(data_dir.join("blobs")))
            .expect("opening the default content store");
        Mutex::new(
            JobManager::new(
                FunctionRegistry::new(),
                Some(Arc::new(hither_cache::MemoryJobCache::new())),
                Arc::new(store),
                Arc::new(hither_container::NullContainerRunner::new(
                    hither_util::discard_logger(),
                )),
                hither_util::discard_logger(),
            )
            .expect("building the default job manager"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hither_base::{ContainerImage, Value};
    use hither_cache::MemoryJobCache;
    use hither_handler::DefaultJobHandler;
    use hither_store::LocalContentStore;
    use std::sync::Arc;

    fn discard() -> Logger {
        hither_util::discard_logger()
    }

    /// Builds a content store with a one-off runtime that is dropped before we return, so tests
    /// stay plain synchronous functions -- `JobManager` builds its own bridge runtime internally
    /// and `tokio::runtime::Runtime::block_on` panics if called while already inside another
    /// runtime's async task, so no test here may be `#[tokio::test]`.
    fn store_in(dir: &std::path::Path) -> Arc<dyn ContentStore> {
        let rt = tokio::runtime::Runtime::new().unwrap();
        Arc::new(rt.block_on(LocalContentStore::new(dir)).unwrap())
    }

    fn manager_with(
        store: Arc<dyn ContentStore>,
        cache: Option<Arc<dyn JobCache>>,
    ) -> JobManager {
        JobManager::new(
            FunctionRegistry::new(),
            cache,
            store,
            Arc::new(hither_container::NullContainerRunner::new(discard())),
            discard(),
        )
        .unwrap()
    }

    fn double_handler() -> Box<dyn JobHandler> {
        Box::new(DefaultJobHandler::new(
            discard(),
            Box::new(|job: &QueuedJob| Ok(Value::Int(job.kwargs.as_int().unwrap() * 2))),
        ))
    }

    fn submit_double(kwargs: Value) -> SubmitJob {
        SubmitJob {
            function_name: "double".into(),
            function_version: "1".into(),
            code: FunctionCode::Local {
                name: "double".into(),
                version: "1".into(),
            },
            label: "double".into(),
            kwargs,
            container: None,
            job_timeout: None,
            flags: JobFlags::default(),
            handler_id: HandlerId::new("default"),
        }
    }

    #[test]
    fn a_job_with_no_dependencies_runs_and_finishes_within_one_wait() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut manager = manager_with(store, None);
        manager.register_handler(HandlerId::new("default"), double_handler());

        let id = manager.submit(submit_double(Value::Int(21)));
        let outcome = manager.wait(&id, Some(Duration::from_secs(1)), true).unwrap();
        match outcome {
            WaitOutcome::Finished(Value::Int(42)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn a_job_depending_on_a_finished_job_resolves_the_job_ref_to_its_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut manager = manager_with(store, None);
        manager.register_handler(HandlerId::new("default"), double_handler());

        let first = manager.submit(submit_double(Value::Int(10)));
        let second = manager.submit(submit_double(Value::job_ref(first)));

        let outcome = manager.wait(&second, Some(Duration::from_secs(1)), true).unwrap();
        match outcome {
            WaitOutcome::Finished(Value::Int(40)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn a_job_depending_on_an_errored_job_errors_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut manager = manager_with(store, None);
        manager.register_handler(
            HandlerId::new("default"),
            Box::new(DefaultJobHandler::new(
                discard(),
                Box::new(|_: &QueuedJob| Err(anyhow::anyhow!("boom"))),
            )),
        );
        manager.register_handler(HandlerId::new("downstream"), double_handler());

        let mut failing = submit_double(Value::Int(1));
        failing.function_name = "fails".into();
        failing.handler_id = HandlerId::new("default");
        let first = manager.submit(failing);

        let mut second = submit_double(Value::job_ref(first));
        second.handler_id = HandlerId::new("downstream");
        let second = manager.submit(second);

        let outcome = manager.wait(&second, Some(Duration::from_secs(1)), true).unwrap();
        match outcome {
            WaitOutcome::Errored(message) => assert!(message.contains("boom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn a_cache_hit_skips_the_handler_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cache: Arc<dyn JobCache> = Arc::new(MemoryJobCache::new());
        let mut manager = manager_with(store, Some(cache));
        // A handler that would panic if it were ever invoked, proving the cache hit bypassed it.
        manager.register_handler(
            HandlerId::new("default"),
            Box::new(DefaultJobHandler::new(
                discard(),
                Box::new(|_: &QueuedJob| panic!("handler should not run on a cache hit")),
            )),
        );

        let first = manager.submit(submit_double(Value::Int(5)));
        manager.wait(&first, Some(Duration::from_secs(1)), true).unwrap();

        let second = manager.submit(submit_double(Value::Int(5)));
        let outcome = manager.wait(&second, Some(Duration::from_secs(1)), true).unwrap();
        assert_matches::assert_matches!(outcome, WaitOutcome::Finished(Value::Int(10)));
    }

    #[test]
    fn wait_all_returns_once_every_job_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut manager = manager_with(store, None);
        manager.register_handler(HandlerId::new("default"), double_handler());

        manager.submit(submit_double(Value::Int(1)));
        manager.submit(submit_double(Value::Int(2)));
        manager.wait_all(Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn a_job_with_a_container_on_a_failing_runner_errors_in_the_prepare_phase() {
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl ContainerRunner for AlwaysFails {
            async fn prepare(&self, _image: &ContainerImage) -> anyhow::Result<()> {
                Err(anyhow::anyhow!("no such image"))
            }
            async fn run(
                &self,
                _working_dir: &std::path::Path,
                _image: Option<&ContainerImage>,
                _command: &[String],
                _bind_mounts: &[hither_container::BindMount],
                _timeout: Duration,
            ) -> anyhow::Result<hither_container::RunOutcome> {
                unreachable!()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut manager = JobManager::new(
            FunctionRegistry::new(),
            None,
            store,
            Arc::new(AlwaysFails),
            discard(),
        )
        .unwrap();
        manager.register_handler(HandlerId::new("default"), double_handler());

        let mut req = submit_double(Value::Int(1));
        req.container = Some(ContainerImage::parse("docker://missing").unwrap());
        let id = manager.submit(req);

        let outcome = manager.wait(&id, Some(Duration::from_secs(1)), true).unwrap();
        match outcome {
            WaitOutcome::Errored(message) => assert!(message.contains("missing")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
