//! Tree storage: configuration and the concurrent tree itself.

/// Tree configuration loaded from code or TOML.
pub mod options;
/// Concurrent balanced tree with lock-coupled search and walks.
pub mod tree;

pub use options::{ConfigError, TreeOptions};
pub use tree::Tree;
