//! Call record store boundary.

use async_trait::async_trait;
use ringcore::types::{Call, CallId, CallUpdate, NewCall};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("call not found: {0}")]
    NotFound(CallId),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable call records owned outside this process.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Create a ringing call record; the store assigns id and `created_at`.
    async fn create(&self, new_call: NewCall) -> Result<Call, StoreError>;

    async fn get(&self, id: &CallId) -> Result<Option<Call>, StoreError>;

    async fn update(&self, id: &CallId, update: CallUpdate) -> Result<(), StoreError>;
}
