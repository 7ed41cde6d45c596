//! The job status machine. See spec's invariant: status transitions monotonically toward a
//! terminal status, and once terminal, a job's status/result/error are immutable.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Finished,
    Error,
    /// Observable only on a job held by a remote compute resource, between the handler
    /// registering the job and the resource reporting it queued.
    Waiting,
    /// Observable only on a remotely held job that was cancelled server-side.
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error | JobStatus::Canceled)
    }

    pub fn is_prerun(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Queued | JobStatus::Waiting)
    }

    pub fn is_incomplete(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running | JobStatus::Waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_match_spec_table() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
