//! Upstream market-data collaborator consumed by the stream feed

use async_trait::async_trait;

use crate::DeribitResult;

/// Produces a payload snapshot for a symbol on demand.
///
/// Implementations return [`DeribitError::Unavailable`](crate::DeribitError)
/// (or any other error) when no snapshot can be produced; the caller skips
/// that symbol for the current tick.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> DeribitResult<serde_json::Value>;
}
