use anyhow::Result;
use async_trait::async_trait;

/// Source of mirror URLs. The pool calls this whenever a worker slot opens,
/// potentially often. Implementations may repeat URLs and return them in any
/// order; they are never told about mirror failures.
#[async_trait]
pub trait MirrorProvider: Send + Sync {
    async fn next_mirror(&self) -> Result<String>;
}
