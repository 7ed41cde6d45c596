//! The standard terminal logger chain every hither binary starts with: a decorated, leveled,
//! asynchronous drain. Mirrors `maelstrom-broker`/`maelstrom-worker`'s `main.rs` wiring exactly; pulled out
//! here so `hither-broker`, `hither-run`, and the parallel worker re-exec entry point don't each
//! reimplement it.

use slog::{Drain, Level, Logger, OwnedKVList, Record};
use slog_async::Async;
use slog_term::{FullFormat, TermDecorator};
use std::str::FromStr;

/// Command-line/config log level, kept as its own small type so [`clap`] can parse it directly
/// and so config structs can derive `Debug` without dragging in `slog::Level`, which doesn't
/// implement it in a way `clap` can use for parsing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_slog_level(self) -> Level {
        match self {
            LogLevel::Critical => Level::Critical,
            LogLevel::Error => Level::Error,
            LogLevel::Warning => Level::Warning,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
            LogLevel::Trace => Level::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(LogLevel::Critical),
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// Builds the root logger every hither binary uses: colored terminal output, filtered to
/// `level`, drained on a background thread so logging never blocks the tokio reactor.
pub fn root_logger(level: LogLevel) -> Logger {
    let decorator = TermDecorator::new().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level.as_slog_level()).fuse();
    Logger::root(drain, slog::o!())
}

/// A drain that discards everything, for tests that need a `Logger` but don't want console
/// noise.
pub fn discard_logger() -> Logger {
    Logger::root(DiscardDrain, slog::o!())
}

struct DiscardDrain;

impl Drain for DiscardDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, _record: &Record, _values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        Ok(())
    }
}
