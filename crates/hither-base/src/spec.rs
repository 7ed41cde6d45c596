//! The serializable, self-contained description of one job invocation. Produced by
//! [`crate::JobSpec::serialize`] (logically; the actual serializer lives alongside the job type
//! in `hither-manager`, since it needs access to the function registry to resolve a callable to
//! a code blob) and consumed unchanged by a worker process, a batch allocation, or a compute
//! resource.

use crate::{ContainerImage, Fingerprint, JobId, Value};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The five boolean flags that change how a job is cached and resolved. Grouped into their own
/// type because they travel together through serialization, fingerprinting, and the cache.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobFlags {
    pub download_results: bool,
    pub no_resolve_input_files: bool,
    pub cache_failing: bool,
    pub rerun_failing: bool,
    pub force_run: bool,
}

/// Either a function the current process can call directly, or an opaque blob of transportable
/// code meant for a remote process that doesn't share this process's function registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FunctionCode {
    /// An index into the submitting process's [`crate::FunctionRegistry`]. Only meaningful
    /// in-process or to a worker that was forked from the same registry; never sent over a
    /// feed.
    Local { name: String, version: String },
    /// A self-contained, transportable representation of the function body. What exactly this
    /// contains is up to the registry that produced it (e.g. a serialized closure plus its
    /// captured environment); the core only ever treats it as an opaque blob to hash, store, and
    /// hand back unchanged.
    Transportable(Vec<u8>),
}

/// The serialized, self-contained record for one job invocation. This is what crosses a worker
/// pipe or a feed message; see spec's "Serialized Job record" field list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: JobId,
    pub function_name: String,
    pub function_version: String,
    pub code: FunctionCode,
    pub label: String,
    pub kwargs: Value,
    pub container: Option<ContainerImage>,
    #[serde(with = "duration_millis_option")]
    pub job_timeout: Option<Duration>,
    pub flags: JobFlags,
}

impl JobSpec {
    /// Computes this job's fingerprint. Arguments must already be fully resolved -- panics (in
    /// debug builds) if a [`Value::JobRef`] is still reachable in `kwargs`, per spec's
    /// invariant that a fingerprint is only ever computed over resolved arguments.
    pub fn fingerprint(&self) -> Fingerprint {
        debug_assert!(
            self.kwargs.is_resolved(),
            "fingerprinting a job with unresolved JobRef arguments"
        );
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.function_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.function_version.as_bytes());
        hasher.update(b"\0");
        let kwargs_json =
            serde_json::to_vec(&self.kwargs).expect("Value always serializes to JSON");
        hasher.update(&kwargs_json);
        // Cache-affecting flags participate in the fingerprint; handler-routing flags
        // (download_results) do not, since they don't change what the function computes.
        hasher.update([
            self.flags.no_resolve_input_files as u8,
            self.flags.cache_failing as u8,
            self.flags.rerun_failing as u8,
        ]);
        Fingerprint::from_hasher(hasher)
    }
}

mod duration_millis_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueMap;

    fn spec_with_kwargs(kwargs: Value) -> JobSpec {
        JobSpec {
            job_id: JobId::new(),
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
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_order_sensitive() {
        let mut m1 = ValueMap::new();
        m1.insert("x", Value::Int(1));
        let mut m2 = ValueMap::new();
        m2.insert("x", Value::Int(2));

        let fp1a = spec_with_kwargs(Value::map(m1.clone())).fingerprint();
        let fp1b = spec_with_kwargs(Value::map(m1)).fingerprint();
        let fp2 = spec_with_kwargs(Value::map(m2)).fingerprint();

        assert_eq!(fp1a, fp1b);
        assert_ne!(fp1a, fp2);
    }

    #[test]
    fn different_function_names_produce_different_fingerprints() {
        let mut a = spec_with_kwargs(Value::Int(1));
        let mut b = a.clone();
        b.function_name = "add_two".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
        a.function_version = "2.0.0".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
