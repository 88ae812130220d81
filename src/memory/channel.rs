use crate::channel::{ChannelError, ChannelStream, DeliveryChannel, OutboundChannel, SignalRecord};
use async_trait::async_trait;
use log::debug;
use ringcore::types::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Subscribers = Vec<mpsc::UnboundedSender<serde_json::Value>>;

#[derive(Default)]
struct ChannelState {
    topics: HashMap<String, Subscribers>,
    watchers: HashMap<(String, UserId), Subscribers>,
    rows: Vec<SignalRecord>,
    subscribe_calls: HashMap<String, usize>,
    open_calls: HashMap<String, usize>,
    published: HashMap<String, usize>,
    /// Bumped when a topic's outbound channels are closed; older handles fail.
    outbound_epoch: HashMap<String, u64>,
    drop_broadcast: bool,
    fail_sends: bool,
}

fn deliver(subscribers: &mut Subscribers, payload: &serde_json::Value) {
    subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
}

/// Loopback pub/sub hub with an in-memory durable table.
#[derive(Default, Clone)]
pub struct MemoryChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    /// Silently lose every broadcast message (the durable path still works).
    pub fn set_drop_broadcast(&self, drop: bool) {
        self.lock().drop_broadcast = drop;
    }

    /// Make every broadcast send and durable insert fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Close every outbound channel opened for `topic` so far, as a dropped
    /// connection would. Channels opened afterwards work again.
    pub fn close_outbound(&self, topic: &str) {
        *self
            .lock()
            .outbound_epoch
            .entry(topic.to_string())
            .or_default() += 1;
    }

    pub fn rows(&self) -> Vec<SignalRecord> {
        self.lock().rows.clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    pub fn watcher_count(&self, table: &str, receiver_id: &UserId) -> usize {
        self.lock()
            .watchers
            .get(&(table.to_string(), receiver_id.clone()))
            .map_or(0, Vec::len)
    }

    pub fn subscribe_calls(&self, topic: &str) -> usize {
        self.lock().subscribe_calls.get(topic).copied().unwrap_or(0)
    }

    pub fn open_calls(&self, topic: &str) -> usize {
        self.lock().open_calls.get(topic).copied().unwrap_or(0)
    }

    /// Broadcast messages accepted for `topic`, delivered or not.
    pub fn published_count(&self, topic: &str) -> usize {
        self.lock().published.get(topic).copied().unwrap_or(0)
    }
}

struct MemoryOutbound {
    topic: String,
    epoch: u64,
    state: Arc<Mutex<ChannelState>>,
}

#[async_trait]
impl OutboundChannel for MemoryOutbound {
    async fn send(&self, payload: serde_json::Value) -> Result<(), ChannelError> {
        let mut state = self.state.lock().expect("Mutex should not be poisoned");
        if state.outbound_epoch.get(&self.topic).copied().unwrap_or(0) != self.epoch {
            return Err(ChannelError::Closed);
        }
        if state.fail_sends {
            return Err(ChannelError::Send(format!("{} unavailable", self.topic)));
        }
        *state.published.entry(self.topic.clone()).or_default() += 1;
        if state.drop_broadcast {
            debug!("memory channel: dropping broadcast on {}", self.topic);
            return Ok(());
        }
        if let Some(subscribers) = state.topics.get_mut(&self.topic) {
            deliver(subscribers, &payload);
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryChannel for MemoryChannel {
    async fn subscribe(&self, topic: &str) -> Result<ChannelStream, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        *state.subscribe_calls.entry(topic.to_string()).or_default() += 1;
        state.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ChannelError> {
        self.lock().topics.remove(topic);
        Ok(())
    }

    async fn open(&self, topic: &str) -> Result<Arc<dyn OutboundChannel>, ChannelError> {
        let epoch = {
            let mut state = self.lock();
            *state.open_calls.entry(topic.to_string()).or_default() += 1;
            state.outbound_epoch.get(topic).copied().unwrap_or(0)
        };
        Ok(Arc::new(MemoryOutbound {
            topic: topic.to_string(),
            epoch,
            state: self.state.clone(),
        }))
    }

    async fn insert(&self, record: SignalRecord) -> Result<(), ChannelError> {
        let mut state = self.lock();
        if state.fail_sends {
            return Err(ChannelError::Insert(format!("{} unavailable", record.table)));
        }
        let key = (record.table.clone(), record.receiver_id.clone());
        if let Some(watchers) = state.watchers.get_mut(&key) {
            deliver(watchers, &record.payload);
        }
        state.rows.push(record);
        Ok(())
    }

    async fn watch_inserts(
        &self,
        table: &str,
        receiver_id: &UserId,
    ) -> Result<ChannelStream, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .watchers
            .entry((table.to_string(), receiver_id.clone()))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn unwatch_inserts(
        &self,
        table: &str,
        receiver_id: &UserId,
    ) -> Result<(), ChannelError> {
        self.lock()
            .watchers
            .remove(&(table.to_string(), receiver_id.clone()));
        Ok(())
    }
}
