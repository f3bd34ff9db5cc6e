use async_trait::async_trait;

use crate::domain::Event;
use crate::error::StoreError;

/// Persistence capability consumed by the ingestion handler.
///
/// Implementations own their retry policy, if any; callers never retry.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn store(&self, event: &Event) -> std::result::Result<(), StoreError>;
}
