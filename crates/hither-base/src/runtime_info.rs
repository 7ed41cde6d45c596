//! Console capture and timing, produced by every run whether it succeeds or fails.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub timestamp_unix_ms: i64,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub console_lines: Vec<ConsoleLine>,
    pub start_timestamp_unix_ms: Option<i64>,
    pub finish_timestamp_unix_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub canceled: bool,
}

impl RuntimeInfo {
    pub fn started_now(now_unix_ms: i64) -> Self {
        Self {
            start_timestamp_unix_ms: Some(now_unix_ms),
            ..Default::default()
        }
    }

    pub fn finish(&mut self, now_unix_ms: i64, exit_code: Option<i32>) {
        self.finish_timestamp_unix_ms = Some(now_unix_ms);
        self.exit_code = exit_code;
    }

    pub fn push_line(&mut self, timestamp_unix_ms: i64, text: impl Into<String>) {
        self.console_lines.push(ConsoleLine {
            timestamp_unix_ms,
            text: text.into(),
        });
    }

    pub fn mark_canceled(&mut self) {
        self.canceled = true;
    }
}
