//! Tracing subscriber setup shared by the CLI and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, TreeError};

/// Installs a global fmt subscriber filtered by `filter` (an `EnvFilter`
/// directive such as `info` or `treelock=debug`).
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter).map_err(|_| TreeError::InvalidArgument("invalid log filter"))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| TreeError::InvalidArgument("logging already initialized"))
}
