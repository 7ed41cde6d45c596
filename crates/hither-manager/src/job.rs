//! A single job's mutable state as tracked by the manager. A [`Job`] is never handed out by
//! reference -- callers only ever hold its [`JobId`] and go through [`crate::JobManager`] to
//! read or wait on it -- so every transition happens in one place, under `&mut JobManager`.

use hither_base::{
    ContainerImage, Fingerprint, FunctionCode, JobFlags, JobId, JobSpec, JobStatus, RuntimeInfo,
    Value,
};
use std::fmt;
use std::time::Duration;

/// The name under which the manager's built-in return-argument-unchanged function is
/// registered. Used only to build the "substitute identity job" a remote-job [`Job::wait`]
/// inserts when it needs to force a result's files to become locally resolvable.
pub const IDENTITY_FUNCTION_NAME: &str = "_hither_manager_identity";
pub const IDENTITY_FUNCTION_VERSION: &str = "1";

pub(crate) fn identity(kwargs: &Value) -> anyhow::Result<Value> {
    Ok(kwargs.clone())
}

/// Caller-assigned name for one of the handlers registered with a [`crate::JobManager`]. Kept
/// distinct from [`hither_base::HandlerUri`], which names a handler on the wire between a remote
/// handler and a compute resource -- a `HandlerId` never leaves this process.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What a caller hands the manager to submit a new job. Mirrors the fields of [`JobSpec`] plus
/// the `HandlerId` naming which registered handler runs it; the manager fills in `job_id` and
/// initial status itself.
#[derive(Clone, Debug)]
pub struct SubmitJob {
    pub function_name: String,
    pub function_version: String,
    pub code: FunctionCode,
    pub label: String,
    pub kwargs: Value,
    pub container: Option<ContainerImage>,
    pub job_timeout: Option<Duration>,
    pub flags: JobFlags,
    pub handler_id: HandlerId,
}

/// One submitted job's full mutable state. `kwargs` may still contain [`Value::JobRef`]s into
/// sibling jobs tracked by the same manager until the dispatch phase resolves them.
#[derive(Clone, Debug)]
pub struct Job {
    pub(crate) job_id: JobId,
    pub(crate) function_name: String,
    pub(crate) function_version: String,
    pub(crate) code: FunctionCode,
    pub(crate) label: String,
    pub(crate) kwargs: Value,
    pub(crate) container: Option<ContainerImage>,
    pub(crate) job_timeout: Option<Duration>,
    pub(crate) flags: JobFlags,
    pub(crate) handler_id: HandlerId,
    pub(crate) status: JobStatus,
    pub(crate) result: Option<Value>,
    pub(crate) error_message: Option<String>,
    pub(crate) runtime_info: RuntimeInfo,
    pub(crate) fingerprint: Option<Fingerprint>,
    /// Set when this job's terminal state came from a cache hit rather than actual execution,
    /// so the reap phase doesn't write it straight back to the same cache record it just read.
    pub(crate) from_cache: bool,
}

impl Job {
    pub(crate) fn new(job_id: JobId, req: SubmitJob) -> Self {
        Self {
            job_id,
            function_name: req.function_name,
            function_version: req.function_version,
            code: req.code,
            label: req.label,
            kwargs: req.kwargs,
            container: req.container,
            job_timeout: req.job_timeout,
            flags: req.flags,
            handler_id: req.handler_id,
            status: JobStatus::Queued,
            result: None,
            error_message: None,
            runtime_info: RuntimeInfo::default(),
            fingerprint: None,
            from_cache: false,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn runtime_info(&self) -> &RuntimeInfo {
        &self.runtime_info
    }

    pub fn handler_id(&self) -> &HandlerId {
        &self.handler_id
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    /// The record crossing a worker pipe, a batch allocation, or a compute resource feed.
    /// `generate_code` selects between a reference into this process's function registry
    /// (`FunctionCode::Local`, only meaningful to a process sharing that registry) and an
    /// already-transportable code blob; we never synthesize one from a `Job` that was only ever
    /// given a `Local` reference, since that would need the source-to-bytes transformer this
    /// workspace deliberately doesn't build (callers that need remote execution must submit the
    /// job with `FunctionCode::Transportable` to begin with).
    pub fn serialize(&self, generate_code: bool) -> hither_base::Result<JobSpec> {
        let code = if generate_code {
            match &self.code {
                FunctionCode::Transportable(bytes) => FunctionCode::Transportable(bytes.clone()),
                FunctionCode::Local { .. } => {
                    return Err(hither_base::HitherError::NotSerializable(format!(
                        "job {} has no transportable code to generate; it was submitted with a \
                         local function reference only",
                        self.job_id
                    )))
                }
            }
        } else {
            self.code.clone()
        };
        Ok(JobSpec {
            job_id: self.job_id.clone(),
            function_name: self.function_name.clone(),
            function_version: self.function_version.clone(),
            code,
            label: self.label.clone(),
            kwargs: self.kwargs.clone(),
            container: self.container.clone(),
            job_timeout: self.job_timeout,
            flags: self.flags,
        })
    }

    /// Reconstructs a pending [`Job`] from a [`JobSpec`] received over the wire. Deliberately
    /// takes no manager, cache, or handler -- those are supplied by whatever context is doing
    /// the deserializing (a worker process executes it directly; a batch allocation or compute
    /// resource re-submits it to its own `JobManager` under a handler of its own choosing).
    pub fn deserialize(spec: JobSpec, handler_id: HandlerId) -> Self {
        Self {
            job_id: spec.job_id,
            function_name: spec.function_name,
            function_version: spec.function_version,
            code: spec.code,
            label: spec.label,
            kwargs: spec.kwargs,
            container: spec.container,
            job_timeout: spec.job_timeout,
            flags: spec.flags,
            handler_id,
            status: JobStatus::Queued,
            result: None,
            error_message: None,
            runtime_info: RuntimeInfo::default(),
            fingerprint: None,
            from_cache: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hither_base::JobId;

    fn submit(kwargs: Value) -> SubmitJob {
        SubmitJob {
            function_name: "add_one".into(),
            function_version: "1.0.0".into(),
            code: FunctionCode::Local {
                name: "add_one".into(),
                version: "1.0.0".into(),
            },
            label: "add_one".into(),
            kwargs,
            container: None,
            job_timeout: None,
            flags: JobFlags::default(),
            handler_id: HandlerId::new("default"),
        }
    }

    #[test]
    fn new_job_starts_queued_with_no_result() {
        let job = Job::new(JobId::new(), submit(Value::Int(1)));
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(job.result().is_none());
    }

    #[test]
    fn serializing_a_local_only_job_with_generate_code_fails() {
        let job = Job::new(JobId::new(), submit(Value::Int(1)));
        assert!(job.serialize(true).is_err());
        assert!(job.serialize(false).is_ok());
    }

    #[test]
    fn serialize_then_deserialize_round_trips_the_spec_fields() {
        let mut req = submit(Value::Str("hi".into()));
        req.code = FunctionCode::Transportable(b"code".to_vec());
        let job = Job::new(JobId::new(), req);
        let spec = job.serialize(true).unwrap();
        let restored = Job::deserialize(spec, HandlerId::new("worker"));
        assert_eq!(restored.function_name, "add_one");
        assert_eq!(restored.kwargs, Value::Str("hi".into()));
        assert_eq!(restored.status(), JobStatus::Queued);
    }
}
