//! CLI command implementations.

pub mod aggregates;
pub mod curves;
pub mod index;
pub mod ingest;
pub mod merge;
pub mod poll;
pub mod train;
pub mod wti;

use waitline_core::{LockGuard, ProcessLock, RootLayout};

/// Acquires the pipeline lock for a command, surfacing contention as the
/// documented exit-code-2 error.
pub(crate) fn acquire_pipeline_lock(
    layout: &RootLayout,
    owner: &str,
) -> anyhow::Result<LockGuard> {
    let lock = ProcessLock::new(layout.pipeline_lock(), owner);
    Ok(lock.acquire()?)
}
