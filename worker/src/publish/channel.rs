//! Publish-only channel abstraction

use async_trait::async_trait;

use crate::errors::WorkerError;

/// A pub/sub transport the worker can only publish to
///
/// Implementations are long-lived and shared by every publisher of one
/// pipeline run. `close` must flush anything still in flight.
#[async_trait]
pub trait PublishChannel: Send + Sync {
    /// Publish one payload under `key`
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), WorkerError>;

    /// Flush pending publishes and release the connection
    async fn close(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}
