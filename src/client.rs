//! Composition root: wires signaling, the call manager and the external
//! collaborators for one user, and owns their process-scoped lifecycle.

use crate::calls::{CallError, CallManager, CallServices, SessionEvent};
use crate::channel::DeliveryChannel;
use crate::config::CallConfig;
use crate::cues::{LogCues, SoundCues};
use crate::media::MediaSource;
use crate::peer::PeerConnectionFactory;
use crate::signaling::{SignalingService, Subscription};
use crate::store::CallStore;
use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use ringcore::types::{Call, CallEventHandler, CallType, Signal, UserId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

type SessionEvents = Arc<Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>>;

pub struct CallClient {
    user_id: UserId,
    signaling: Arc<SignalingService>,
    manager: Arc<CallManager>,
    /// Parked here whenever the dispatch loop is not running.
    session_events: SessionEvents,
    subscription: Mutex<Option<Subscription>>,
    /// Dispatch task and the notifier that stops it, fresh for every `init`.
    dispatch: Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>,
    is_running: AtomicBool,
}

impl CallClient {
    pub fn builder() -> CallClientBuilder {
        CallClientBuilder::new()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn manager(&self) -> &Arc<CallManager> {
        &self.manager
    }

    pub fn signaling(&self) -> &Arc<SignalingService> {
        &self.signaling
    }

    /// Subscribe to the user's signals and start dispatching them, together
    /// with session events, into the call manager.
    pub async fn init(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("CallClient `init` called while already running.");
            return Ok(());
        }

        let Some(session_events) = self.session_events.lock().await.take() else {
            self.is_running.store(false, Ordering::SeqCst);
            return Err(anyhow!("session event stream for {} is in use", self.user_id));
        };

        let (tx, signals) = mpsc::unbounded_channel::<Signal>();
        let subscription = self.signaling.subscribe(&self.user_id, Arc::new(tx)).await;
        *self.subscription.lock().await = Some(subscription);

        let shutdown_notifier = Arc::new(Notify::new());
        let task = tokio::spawn(dispatch_loop(
            self.manager.clone(),
            signals,
            session_events,
            shutdown_notifier.clone(),
            self.session_events.clone(),
        ));
        *self.dispatch.lock().await = Some((task, shutdown_notifier));

        info!("Call client for {} is running", self.user_id);
        Ok(())
    }

    /// End any live call, stop dispatching and drop the signal subscription.
    pub async fn shutdown(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.manager.shutdown().await;
        if let Some(subscription) = self.subscription.lock().await.take() {
            self.signaling.unsubscribe(subscription).await;
        }

        if let Some((task, shutdown_notifier)) = self.dispatch.lock().await.take() {
            shutdown_notifier.notify_one();
            if let Err(e) = task.await {
                warn!("Dispatch loop for {} ended abnormally: {}", self.user_id, e);
            }
        }
        self.signaling.shutdown().await;
        info!("Call client for {} has shut down", self.user_id);
    }

    pub async fn initiate_call(
        &self,
        receiver_id: impl Into<UserId>,
        call_type: CallType,
    ) -> Result<Call, CallError> {
        self.manager
            .initiate_call(receiver_id.into(), call_type)
            .await
    }

    pub async fn accept_call(&self) -> Result<Call, CallError> {
        self.manager.accept_call().await
    }

    pub async fn decline_call(&self) -> Result<Call, CallError> {
        self.manager.decline_call().await
    }

    pub async fn end_call(&self) -> Result<Call, CallError> {
        self.manager.end_call().await
    }
}

async fn dispatch_loop(
    manager: Arc<CallManager>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: Arc<Notify>,
    parking: SessionEvents,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            signal = signals.recv() => match signal {
                Some(signal) => manager.handle_signal(signal).await,
                None => break,
            },
            Some(event) = session_events.recv() => manager.handle_session_event(event).await,
        }
    }
    *parking.lock().await = Some(session_events);
    debug!("Dispatch loop for {} stopped", manager.user_id());
}

pub struct CallClientBuilder {
    user_id: Option<UserId>,
    channel: Option<Arc<dyn DeliveryChannel>>,
    store: Option<Arc<dyn CallStore>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    media: Option<Arc<dyn MediaSource>>,
    cues: Option<Arc<dyn SoundCues>>,
    config: CallConfig,
    handlers: Vec<Arc<dyn CallEventHandler>>,
}

impl CallClientBuilder {
    fn new() -> Self {
        Self {
            user_id: None,
            channel: None,
            store: None,
            peers: None,
            media: None,
            cues: None,
            config: CallConfig::default(),
            handlers: Vec::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CallStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Defaults to [`LogCues`].
    pub fn with_cues(mut self, cues: Arc<dyn SoundCues>) -> Self {
        self.cues = Some(cues);
        self
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_event(mut self, handler: Arc<dyn CallEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<CallClient> {
        let user_id = self
            .user_id
            .ok_or_else(|| anyhow!("A user id is required to build a CallClient"))?;
        let channel = self
            .channel
            .ok_or_else(|| anyhow!("A delivery channel is required to build a CallClient"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow!("A call store is required to build a CallClient"))?;
        let peers = self.peers.ok_or_else(|| {
            anyhow!("A peer connection factory is required to build a CallClient")
        })?;
        let media = self
            .media
            .ok_or_else(|| anyhow!("A media source is required to build a CallClient"))?;
        let cues = self.cues.unwrap_or_else(|| Arc::new(LogCues));

        let signaling = Arc::new(SignalingService::new(
            channel,
            self.config.signaling.clone(),
        ));
        let (manager, session_events) = CallManager::new(
            user_id.clone(),
            self.config,
            signaling.clone(),
            CallServices {
                store,
                peers,
                media,
                cues,
            },
        );
        for handler in self.handlers {
            manager.event_bus().add_handler(handler);
        }

        Ok(CallClient {
            user_id,
            signaling,
            manager,
            session_events: Arc::new(Mutex::new(Some(session_events))),
            subscription: Mutex::new(None),
            dispatch: Mutex::new(None),
            is_running: AtomicBool::new(false),
        })
    }
}
