//! Shared fixtures for integration tests that need a working [`hither_manager::JobManager`]
//! without each crate's `tests/` directory re-deriving the same content store and cache
//! boilerplate. Mirrors `maelstrom-test-runner`'s fake-framework module: a small set of
//! builders, not a mock of the whole system.

use hither_base::{ContainerImage, FunctionCode, FunctionRegistry, JobFlags, Value};
use hither_cache::JobCache;
use hither_container::{ContainerRunner, NullContainerRunner};
use hither_manager::{HandlerId, JobManager, SubmitJob};
use hither_store::{ContentStore, LocalContentStore};
use slog::Logger;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A [`JobManager`] on its own temporary content store, plus the [`TempDir`] backing it --
/// dropping the guard removes the store's on-disk files, so keep it alive for as long as the
/// manager is used.
pub struct TestManager {
    pub manager: JobManager,
    _dir: TempDir,
}

impl std::ops::Deref for TestManager {
    type Target = JobManager;

    fn deref(&self) -> &JobManager {
        &self.manager
    }
}

impl std::ops::DerefMut for TestManager {
    fn deref_mut(&mut self) -> &mut JobManager {
        &mut self.manager
    }
}

/// Opens a [`LocalContentStore`] under a fresh temporary directory. Uses a one-off runtime that
/// is dropped before returning, so this is safe to call from a plain `#[test]` function; it must
/// never be called from inside an existing tokio runtime's task (`JobManager` and its handlers
/// build their own bridge runtime internally, and nesting `block_on` calls panics).
pub fn temp_store(dir: &Path) -> Arc<dyn ContentStore> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building a throwaway tokio runtime");
    Arc::new(
        rt.block_on(LocalContentStore::new(dir))
            .expect("opening a temporary content store"),
    )
}

/// Builds a [`TestManager`] with no cache and a [`NullContainerRunner`] discarding its log
/// output -- the common case for a test that only cares about dependency resolution and
/// dispatch, not caching or containers.
pub fn test_manager() -> TestManager {
    test_manager_with(None)
}

/// As [`test_manager`], but wired to `cache` -- pass `Some` to exercise cache-hit behavior.
pub fn test_manager_with(cache: Option<Arc<dyn JobCache>>) -> TestManager {
    let dir = tempfile::tempdir().expect("creating a temporary directory");
    let store = temp_store(dir.path());
    let manager = JobManager::new(
        FunctionRegistry::new(),
        cache,
        store,
        Arc::new(NullContainerRunner::new(discard_logger())) as Arc<dyn ContainerRunner>,
        discard_logger(),
    )
    .expect("building a test job manager");
    TestManager { manager, _dir: dir }
}

pub fn discard_logger() -> Logger {
    hither_util::discard_logger()
}

/// A [`SubmitJob`] for an in-process function with sensible defaults: no container, no timeout,
/// every flag false, and the `"default"` handler. Override whichever fields the test actually
/// cares about on the returned value.
pub fn job(function_name: &str, version: &str, kwargs: Value) -> SubmitJob {
    SubmitJob {
        function_name: function_name.to_string(),
        function_version: version.to_string(),
        code: FunctionCode::Local {
            name: function_name.to_string(),
            version: version.to_string(),
        },
        label: function_name.to_string(),
        kwargs,
        container: None,
        job_timeout: None,
        flags: JobFlags::default(),
        handler_id: HandlerId::new("default"),
    }
}

/// [`job`] with `container` set, for tests that need to exercise the prepare-containers phase.
pub fn containerized_job(function_name: &str, version: &str, kwargs: Value, image: &str) -> SubmitJob {
    let mut spec = job(function_name, version, kwargs);
    spec.container = Some(ContainerImage::parse(image).expect("valid container image URI"));
    spec
}

/// The default timeout integration tests pass to `wait`/`wait_all`: long enough that a slow CI
/// machine doesn't flake, short enough that a genuinely stuck test fails promptly.
pub fn patience() -> Duration {
    Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hither_base::JobStatus;

    #[test]
    fn test_manager_runs_a_trivial_job_through_a_registered_handler() {
        let mut tm = test_manager();
        tm.register_handler(
            HandlerId::new("default"),
            Box::new(hither_handler::DefaultJobHandler::new(
                discard_logger(),
                Box::new(|q: &hither_handler::QueuedJob| Ok(q.kwargs.clone())),
            )),
        );
        let id = tm.submit(job("identity", "1", Value::Int(7)));
        tm.wait_all(Some(patience())).unwrap();
        assert_eq!(tm.status(&id), Some(JobStatus::Finished));
        assert_eq!(tm.result(&id), Some(&Value::Int(7)));
    }
}
