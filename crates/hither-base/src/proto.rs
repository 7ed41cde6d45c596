//! The wire protocol exchanged between a [`crate`]-level remote job handler and a compute
//! resource, over the feed transport `hither-feed` defines. Grounded on
//! `maelstrom-base::proto`'s enums for shape (one tagged enum per direction, every variant a
//! struct-like payload) but tagged with `#[serde(tag = "type")]` instead of bincode framing,
//! since the underlying transport here is a feed of JSON messages rather than a length-prefixed
//! socket controlled end to end by one process.

use crate::{ContainerImage, Fingerprint, HandlerUri, JobFlags, JobId, RuntimeInfo, Sha256Hex, Value};
use serde::{Deserialize, Serialize};

/// Appended by a job handler to the well-known job-handler registry subfeed to announce itself.
/// The one message type that doesn't flow over a per-handler connection, since the connection
/// doesn't exist yet when it's sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryMessage {
    AddJobHandler {
        handler_uri: HandlerUri,
        /// Subfeed the resource should reply on once it has accepted the handler.
        reply_subfeed: String,
    },
}

/// Messages a job handler appends to its private subfeed, consumed by the compute resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerToResource {
    AddJob {
        job_id: JobId,
        function_name: String,
        function_version: String,
        /// Hash of the job's code blob, already pushed into the content store by the handler --
        /// the blob itself never travels inline in this message.
        code_hash: Sha256Hex,
        kwargs: Value,
        container: Option<ContainerImage>,
        job_timeout_ms: Option<u64>,
        flags: JobFlags,
    },
    CancelJob {
        job_id: JobId,
    },
    /// Sent periodically; the resource drops the handler's jobs if this stops arriving for
    /// longer than its configured keepalive timeout.
    ReportAlive,
    /// Sent once, when the handler is shutting down cleanly.
    JobHandlerFinished,
}

/// Messages the compute resource appends to a handler's outbound subfeed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceToHandler {
    JobHandlerRegistered,
    JobQueued {
        job_id: JobId,
        fingerprint: Fingerprint,
    },
    JobStarted {
        job_id: JobId,
    },
    JobFinished {
        job_id: JobId,
        /// Small results travel inline; large ones are left in the content store and referenced
        /// by hash, per the result-size policy in `hither-broker`.
        result: JobResult,
        runtime_info: RuntimeInfo,
    },
    JobError {
        job_id: JobId,
        error_message: String,
        runtime_info: RuntimeInfo,
    },
}

/// A finished job's result, either carried inline or left in the content store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum JobResult {
    Inline { value: Value },
    Stored { sha1_path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_to_resource_round_trips_through_json() {
        let msg = HandlerToResource::AddJob {
            job_id: JobId::new(),
            function_name: "f".into(),
            function_version: "1.0.0".into(),
            code_hash: Sha256Hex::from("abc123".to_string()),
            kwargs: Value::Null,
            container: None,
            job_timeout_ms: None,
            flags: JobFlags::default(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ADD_JOB\""));
        let back: HandlerToResource = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, HandlerToResource::AddJob { .. }));
    }

    #[test]
    fn job_result_tags_distinguish_storage_kind() {
        let inline = JobResult::Inline { value: Value::Int(1) };
        let stored = JobResult::Stored {
            sha1_path: "abc".into(),
        };
        let inline_json = serde_json::to_value(&inline).unwrap();
        let stored_json = serde_json::to_value(&stored).unwrap();
        assert_eq!(inline_json["storage"], "inline");
        assert_eq!(stored_json["storage"], "stored");
    }
}
