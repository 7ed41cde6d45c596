//! Configuration loading. The Python source built up its configuration as a stack of nested
//! `with hi.config(...)` context managers, mutating thread-local state for the duration of a
//! `with` block. Rust has no equivalent dynamic scoping worth imitating; every hither component
//! instead takes an explicit, immutable configuration value constructed once at startup, in the
//! same spirit as `maelstrom-broker`/`maelstrom-worker`'s own binaries (`clap` for command-line/environment
//! overrides layered over `xdg::BaseDirectories` for on-disk defaults).

use anyhow::{Context, Result};
use std::path::PathBuf;
use xdg::BaseDirectories;

/// Resolves the XDG base directories for a hither binary. `prefix` is e.g. `"hither/broker"`.
pub fn base_directories(prefix: &str) -> Result<BaseDirectories> {
    BaseDirectories::with_prefix(prefix)
        .with_context(|| format!("resolving XDG base directories for {prefix:?}"))
}

/// The on-disk location jobs, caches, and content-addressed blobs default to when no override is
/// given: `$XDG_DATA_HOME/hither` (falling back to `~/.local/share/hither`), mirroring the
/// Python source's default `~/.hither` state directory.
pub fn default_data_dir(base_directories: &BaseDirectories) -> Result<PathBuf> {
    base_directories
        .create_data_directory("")
        .context("creating hither data directory")
}
