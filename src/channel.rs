//! Delivery channel boundary: a pub/sub transport keyed by user identity.
//!
//! Two delivery modes are offered. The broadcast path fans a JSON message out
//! to whoever is subscribed to a topic right now. The durable path inserts a
//! record into a table and notifies subscribers watching that record's
//! `receiver_id`, so a receiver that was briefly offline still gets it.

use async_trait::async_trait;
use ringcore::types::UserId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Messages delivered to a subscriber, in transport order.
pub type ChannelStream = mpsc::UnboundedReceiver<serde_json::Value>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("subscription to {0} failed: {1}")]
    Subscribe(String, String),
    #[error("delivery failed: {0}")]
    Send(String),
    #[error("durable insert failed: {0}")]
    Insert(String),
}

/// A row written through the durable path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub table: String,
    pub receiver_id: UserId,
    pub payload: serde_json::Value,
}

/// An established outbound broadcast channel to one topic.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send(&self, payload: serde_json::Value) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Start receiving broadcast messages published on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<ChannelStream, ChannelError>;

    /// Stop every broadcast subscription on `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), ChannelError>;

    /// Establish an outbound channel for publishing on `topic`.
    async fn open(&self, topic: &str) -> Result<Arc<dyn OutboundChannel>, ChannelError>;

    /// Durable insert; subscribers watching `record.receiver_id` are notified.
    async fn insert(&self, record: SignalRecord) -> Result<(), ChannelError>;

    /// Start receiving payloads of rows inserted into `table` for `receiver_id`.
    async fn watch_inserts(
        &self,
        table: &str,
        receiver_id: &UserId,
    ) -> Result<ChannelStream, ChannelError>;

    /// Stop watching `table` for `receiver_id`.
    async fn unwatch_inserts(&self, table: &str, receiver_id: &UserId)
    -> Result<(), ChannelError>;
}
