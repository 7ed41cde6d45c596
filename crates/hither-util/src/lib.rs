//! Ambient plumbing shared across the workspace: configuration loading, the standard logger
//! chain, and adaptive poll backoff. None of this is specific to jobs, caches, or handlers; it's
//! what every binary and long-running task needs regardless of what it's doing.

pub mod config;
pub mod logging;
pub mod poll;

pub use logging::{discard_logger, root_logger, LogLevel};
pub use poll::AdaptivePoller;
