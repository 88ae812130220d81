//! Session-agnostic signal routing.
//!
//! Outgoing signals always go out on the best-effort broadcast path addressed
//! to the receiver; OFFER and ANSWER are additionally written through the
//! durable path so they survive a receiver that is not live right now.
//! Incoming signals for the subscribed user are fanned out to every local
//! listener. Only one transport subscription exists at a time.

use crate::channel::{ChannelError, ChannelStream, DeliveryChannel, OutboundChannel, SignalRecord};
use crate::config::SignalingConfig;
use dashmap::DashMap;
use log::{debug, info, warn};
use ringcore::types::{Signal, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::task::JoinHandle;

/// Receives every signal addressed to the subscribed user.
pub trait SignalListener: Send + Sync {
    fn on_signal(&self, signal: &Signal);
}

impl SignalListener for mpsc::UnboundedSender<Signal> {
    fn on_signal(&self, signal: &Signal) {
        if self.send(signal.clone()).is_err() {
            debug!(
                "Dropping {} for call {}: listener is gone",
                signal.event(),
                signal.call_id
            );
        }
    }
}

/// Token returned by [`SignalingService::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
}

type ListenerMap = Arc<RwLock<HashMap<u64, Arc<dyn SignalListener>>>>;

struct ActiveSubscription {
    user_id: UserId,
    topic: String,
    listeners: ListenerMap,
    pump: JoinHandle<()>,
}

pub struct SignalingService {
    channel: Arc<dyn DeliveryChannel>,
    config: SignalingConfig,
    active: Mutex<Option<ActiveSubscription>>,
    /// One lazily opened outbound channel per receiver.
    outbound: DashMap<UserId, Arc<OnceCell<Arc<dyn OutboundChannel>>>>,
    next_id: AtomicU64,
}

impl SignalingService {
    pub fn new(channel: Arc<dyn DeliveryChannel>, config: SignalingConfig) -> Self {
        Self {
            channel,
            config,
            active: Mutex::new(None),
            outbound: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    /// Register `listener` for every signal addressed to `user_id`.
    ///
    /// Subscribing the user that is already subscribed only adds the listener.
    /// Subscribing a different user first tears down the previous transport
    /// subscription; listeners registered for the previous user are dropped.
    /// Transport errors are logged and leave the listener registered.
    pub async fn subscribe(
        &self,
        user_id: &UserId,
        listener: Arc<dyn SignalListener>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if &current.user_id == user_id {
                current
                    .listeners
                    .write()
                    .expect("RwLock should not be poisoned")
                    .insert(id, listener);
                debug!("Added signal listener {} for {}", id, user_id);
                return Subscription { id };
            }
        }

        if let Some(previous) = active.take() {
            info!(
                "Switching signal subscription from {} to {}",
                previous.user_id, user_id
            );
            self.teardown(previous).await;
        }

        let topic = self.config.topic_for(user_id);
        let broadcast = match self.channel.subscribe(&topic).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", topic, e);
                None
            }
        };
        let durable = match self.channel.watch_inserts(&self.config.table, user_id).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(
                    "Failed to watch {} for {}: {}",
                    self.config.table, user_id, e
                );
                None
            }
        };

        let listeners: ListenerMap = Arc::default();
        listeners
            .write()
            .expect("RwLock should not be poisoned")
            .insert(id, listener);

        let pump = tokio::spawn(pump_signals(
            user_id.clone(),
            broadcast,
            durable,
            listeners.clone(),
        ));

        info!("Subscribed to signals for {}", user_id);
        *active = Some(ActiveSubscription {
            user_id: user_id.clone(),
            topic,
            listeners,
            pump,
        });
        Subscription { id }
    }

    /// Remove one listener; the transport subscription goes away with the last one.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        let mut active = self.active.lock().await;
        let Some(current) = active.as_ref() else {
            return;
        };

        let now_empty = {
            let mut listeners = current
                .listeners
                .write()
                .expect("RwLock should not be poisoned");
            if listeners.remove(&subscription.id).is_none() {
                return;
            }
            listeners.is_empty()
        };

        if now_empty {
            if let Some(current) = active.take() {
                self.teardown(current).await;
            }
        }
    }

    /// Route `signal` to its receiver. Never fails: delivery errors are logged.
    pub async fn send(&self, signal: Signal) {
        let event = signal.event();
        let payload = signal.to_json();

        let durable = async {
            if !event.is_durable() {
                return;
            }
            let record = SignalRecord {
                table: self.config.table.clone(),
                receiver_id: signal.receiver_id.clone(),
                payload: payload.clone(),
            };
            if let Err(e) = self.channel.insert(record).await {
                warn!(
                    "Durable delivery of {} for call {} failed: {}",
                    event, signal.call_id, e
                );
            }
        };

        let broadcast = async {
            let result = match self.outbound_for(&signal.receiver_id).await {
                Ok(outbound) => outbound.send(payload.clone()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(
                    "Broadcast of {} for call {} to {} failed: {}",
                    event, signal.call_id, signal.receiver_id, e
                );
                if matches!(e, ChannelError::Closed) {
                    self.outbound.remove(&signal.receiver_id);
                }
            }
        };

        tokio::join!(durable, broadcast);
        debug!(
            "Sent {} for call {} to {}",
            event, signal.call_id, signal.receiver_id
        );
    }

    /// Drop the subscription and every cached outbound channel.
    pub async fn shutdown(&self) {
        if let Some(current) = self.active.lock().await.take() {
            self.teardown(current).await;
        }
        self.outbound.clear();
    }

    pub async fn subscribed_user(&self) -> Option<UserId> {
        self.active.lock().await.as_ref().map(|a| a.user_id.clone())
    }

    pub async fn listener_count(&self) -> usize {
        self.active.lock().await.as_ref().map_or(0, |a| {
            a.listeners
                .read()
                .expect("RwLock should not be poisoned")
                .len()
        })
    }

    async fn outbound_for(
        &self,
        receiver: &UserId,
    ) -> Result<Arc<dyn OutboundChannel>, ChannelError> {
        let cell = self.outbound.entry(receiver.clone()).or_default().clone();
        let topic = self.config.topic_for(receiver);
        cell.get_or_try_init(|| self.channel.open(&topic))
            .await
            .cloned()
    }

    async fn teardown(&self, subscription: ActiveSubscription) {
        subscription.pump.abort();
        if let Err(e) = self.channel.unsubscribe(&subscription.topic).await {
            warn!("Failed to unsubscribe from {}: {}", subscription.topic, e);
        }
        if let Err(e) = self
            .channel
            .unwatch_inserts(&self.config.table, &subscription.user_id)
            .await
        {
            warn!(
                "Failed to stop watching {} for {}: {}",
                self.config.table, subscription.user_id, e
            );
        }
        info!("Unsubscribed from signals for {}", subscription.user_id);
    }
}

enum Inbound {
    Broadcast(Option<serde_json::Value>),
    Durable(Option<serde_json::Value>),
}

async fn next_message(stream: &mut Option<ChannelStream>) -> Option<serde_json::Value> {
    match stream {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn pump_signals(
    user_id: UserId,
    mut broadcast: Option<ChannelStream>,
    mut durable: Option<ChannelStream>,
    listeners: ListenerMap,
) {
    while broadcast.is_some() || durable.is_some() {
        let inbound = tokio::select! {
            msg = next_message(&mut broadcast) => Inbound::Broadcast(msg),
            msg = next_message(&mut durable) => Inbound::Durable(msg),
        };

        let (payload, path) = match inbound {
            Inbound::Broadcast(Some(payload)) => (payload, "broadcast"),
            Inbound::Durable(Some(payload)) => (payload, "durable"),
            Inbound::Broadcast(None) => {
                broadcast = None;
                continue;
            }
            Inbound::Durable(None) => {
                durable = None;
                continue;
            }
        };

        let signal = match Signal::from_json(payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Dropping malformed {} signal: {}", path, e);
                continue;
            }
        };

        if signal.receiver_id != user_id {
            debug!(
                "Dropping {} for {} received on {}'s {} path",
                signal.event(),
                signal.receiver_id,
                user_id,
                path
            );
            continue;
        }

        debug!(
            "Received {} for call {} from {} via {}",
            signal.event(),
            signal.call_id,
            signal.sender_id,
            path
        );

        let snapshot: Vec<Arc<dyn SignalListener>> = listeners
            .read()
            .expect("RwLock should not be poisoned")
            .values()
            .cloned()
            .collect();
        for listener in snapshot {
            listener.on_signal(&signal);
        }
    }
    debug!("Signal pump for {} stopped", user_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChannel;
    use ringcore::types::{CallId, CallType, IceCandidate, SessionDescription, SignalBody};
    use std::time::Duration;

    fn service(channel: &Arc<MemoryChannel>) -> SignalingService {
        SignalingService::new(channel.clone(), SignalingConfig::default())
    }

    fn signal(from: &str, to: &str, body: SignalBody) -> Signal {
        Signal::new(CallId::new("CALL1"), from.into(), to.into(), body)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Option<Signal> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_resubscribing_same_user_reuses_transport() {
        let channel = Arc::new(MemoryChannel::new());
        let svc = service(&channel);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        svc.subscribe(&"user2".into(), Arc::new(tx1)).await;
        svc.subscribe(&"user2".into(), Arc::new(tx2)).await;

        assert_eq!(channel.subscribe_calls("call-signaling:user2"), 1);
        assert_eq!(svc.listener_count().await, 2);

        let sender = service(&channel);
        sender
            .send(signal(
                "user1",
                "user2",
                SignalBody::CallInit {
                    call_type: CallType::Video,
                },
            ))
            .await;

        assert_eq!(recv(&mut rx1).await.unwrap().event().as_str(), "CALL_INIT");
        assert_eq!(recv(&mut rx2).await.unwrap().event().as_str(), "CALL_INIT");
    }

    #[tokio::test]
    async fn test_last_unsubscribe_tears_down_transport() {
        let channel = Arc::new(MemoryChannel::new());
        let svc = service(&channel);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let a = svc.subscribe(&"user2".into(), Arc::new(tx1)).await;
        let b = svc.subscribe(&"user2".into(), Arc::new(tx2)).await;

        svc.unsubscribe(a).await;
        assert_eq!(channel.subscriber_count("call-signaling:user2"), 1);
        assert_eq!(svc.subscribed_user().await, Some(UserId::new("user2")));

        svc.unsubscribe(b).await;
        assert_eq!(channel.subscriber_count("call-signaling:user2"), 0);
        assert_eq!(channel.watcher_count("call_signals", &"user2".into()), 0);
        assert_eq!(svc.subscribed_user().await, None);

        // Unknown token is a no-op.
        svc.unsubscribe(a).await;
    }

    #[tokio::test]
    async fn test_switching_user_tears_down_previous() {
        let channel = Arc::new(MemoryChannel::new());
        let svc = service(&channel);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let old = svc.subscribe(&"alice".into(), Arc::new(tx1)).await;
        svc.subscribe(&"bob".into(), Arc::new(tx2)).await;

        assert_eq!(channel.subscriber_count("call-signaling:alice"), 0);
        assert_eq!(channel.subscriber_count("call-signaling:bob"), 1);
        assert_eq!(svc.listener_count().await, 1);

        // A stale token from the previous user must not tear down bob.
        svc.unsubscribe(old).await;
        assert_eq!(svc.subscribed_user().await, Some(UserId::new("bob")));
    }

    #[tokio::test]
    async fn test_offer_uses_both_paths_and_ice_only_broadcast() {
        let channel = Arc::new(MemoryChannel::new());
        let svc = service(&channel);

        svc.send(signal(
            "user1",
            "user2",
            SignalBody::Offer {
                sdp: SessionDescription::offer("v=0"),
            },
        ))
        .await;
        svc.send(signal(
            "user1",
            "user2",
            SignalBody::IceCandidate {
                candidate: IceCandidate::new("candidate:1"),
            },
        ))
        .await;

        let rows = channel.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].receiver_id, UserId::new("user2"));
        assert_eq!(rows[0].payload["event"], "OFFER");
        assert_eq!(channel.published_count("call-signaling:user2"), 2);
    }

    #[tokio::test]
    async fn test_outbound_channel_is_opened_once_per_receiver() {
        let channel = Arc::new(MemoryChannel::new());
        let svc = service(&channel);

        for _ in 0..3 {
            svc.send(signal("user1", "user2", SignalBody::CallEnd)).await;
        }
        svc.send(signal("user1", "user3", SignalBody::CallEnd)).await;

        assert_eq!(channel.open_calls("call-signaling:user2"), 1);
        assert_eq!(channel.open_calls("call-signaling:user3"), 1);
    }

    #[tokio::test]
    async fn test_closed_outbound_channel_is_reopened() {
        let channel = Arc::new(MemoryChannel::new());
        let svc = service(&channel);
        let topic = "call-signaling:user2";

        svc.send(signal("user1", "user2", SignalBody::CallAccept)).await;
        channel.close_outbound(topic);

        // The cached channel fails once and is evicted.
        svc.send(signal("user1", "user2", SignalBody::CallEnd)).await;
        assert_eq!(channel.published_count(topic), 1);
        assert_eq!(channel.open_calls(topic), 1);

        svc.send(signal("user1", "user2", SignalBody::CallEnd)).await;
        assert_eq!(channel.open_calls(topic), 2);
        assert_eq!(channel.published_count(topic), 2);
    }

    #[tokio::test]
    async fn test_durable_path_delivers_when_broadcast_is_lost() {
        let channel = Arc::new(MemoryChannel::new());
        channel.set_drop_broadcast(true);
        let svc = service(&channel);
        let (tx, mut rx) = mpsc::unbounded_channel();
        svc.subscribe(&"user2".into(), Arc::new(tx)).await;

        svc.send(signal(
            "user1",
            "user2",
            SignalBody::Answer {
                sdp: SessionDescription::answer("v=0"),
            },
        ))
        .await;
        svc.send(signal("user1", "user2", SignalBody::CallAccept)).await;

        let got = recv(&mut rx).await.unwrap();
        assert_eq!(got.event().as_str(), "ANSWER");
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_send_failures_are_swallowed() {
        let channel = Arc::new(MemoryChannel::new());
        channel.set_fail_sends(true);
        let svc = service(&channel);

        svc.send(signal(
            "user1",
            "user2",
            SignalBody::Offer {
                sdp: SessionDescription::offer("v=0"),
            },
        ))
        .await;

        assert!(channel.rows().is_empty());
    }

    #[tokio::test]
    async fn test_signals_for_other_receivers_are_dropped() {
        let channel = Arc::new(MemoryChannel::new());
        let svc = service(&channel);
        let (tx, mut rx) = mpsc::unbounded_channel();
        svc.subscribe(&"user2".into(), Arc::new(tx)).await;

        // Misaddressed payload published straight onto user2's topic.
        let outbound = channel.open("call-signaling:user2").await.unwrap();
        outbound
            .send(signal("user1", "user9", SignalBody::CallEnd).to_json())
            .await
            .unwrap();
        outbound
            .send(serde_json::json!({ "event": "CALL_END" }))
            .await
            .unwrap();

        assert!(recv(&mut rx).await.is_none());
    }
}
