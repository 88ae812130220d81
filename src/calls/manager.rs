//! Call manager for orchestrating call lifecycle.

use super::error::CallError;
use super::negotiation::{NegotiationSession, Role, SessionEvent, SessionEventKind};
use crate::config::CallConfig;
use crate::cues::{Cue, SoundCues};
use crate::media::{CaptureKind, MediaSource};
use crate::peer::PeerConnectionFactory;
use crate::signaling::SignalingService;
use crate::store::CallStore;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use ringcore::types::{
    Call, CallEvent, CallEventBus, CallId, CallStatus, CallType, CallUpdate, ConnectionState,
    MediaKind, NewCall, Signal, SignalBody, UserId,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

/// External collaborators a [`CallManager`] drives.
#[derive(Clone)]
pub struct CallServices {
    pub store: Arc<dyn CallStore>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaSource>,
    pub cues: Arc<dyn SoundCues>,
}

/// At most one call of each kind is tracked at a time.
#[derive(Default)]
struct CallSlots {
    /// Outgoing call, or an incoming call after it was accepted.
    active: Option<Call>,
    /// Incoming call still ringing.
    incoming: Option<Call>,
}

impl CallSlots {
    fn current(&self) -> Option<&Call> {
        self.active.as_ref().or(self.incoming.as_ref())
    }

    fn find(&self, id: &CallId) -> Option<&Call> {
        [self.active.as_ref(), self.incoming.as_ref()]
            .into_iter()
            .flatten()
            .find(|call| &call.id == id)
    }

    fn clear(&mut self, id: &CallId) {
        if self.active.as_ref().is_some_and(|c| &c.id == id) {
            self.active = None;
        }
        if self.incoming.as_ref().is_some_and(|c| &c.id == id) {
            self.incoming = None;
        }
    }
}

/// Manages the local user's calls and their state transitions.
///
/// Operations and inbound signals are serialized on the call slots. Media
/// negotiation for each live call is delegated to a [`NegotiationSession`]
/// kept in an arena keyed by call id.
pub struct CallManager {
    user_id: UserId,
    config: CallConfig,
    signaling: Arc<SignalingService>,
    services: CallServices,
    event_bus: CallEventBus,
    slots: Mutex<CallSlots>,
    /// Every call seen this process, including finished ones.
    calls: RwLock<HashMap<CallId, Call>>,
    sessions: DashMap<CallId, Arc<NegotiationSession>>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    ring_timers: DashMap<CallId, JoinHandle<()>>,
    this: Weak<Self>,
}

impl CallManager {
    /// Create a manager for `user_id`. Session events must be fed back
    /// through [`handle_session_event`](Self::handle_session_event).
    pub fn new(
        user_id: UserId,
        config: CallConfig,
        signaling: Arc<SignalingService>,
        services: CallServices,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session_events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new_cyclic(|this| Self {
            user_id,
            config,
            signaling,
            services,
            event_bus: CallEventBus::new(),
            slots: Mutex::new(CallSlots::default()),
            calls: RwLock::new(HashMap::new()),
            sessions: DashMap::new(),
            session_events,
            ring_timers: DashMap::new(),
            this: this.clone(),
        });
        (manager, rx)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn event_bus(&self) -> &CallEventBus {
        &self.event_bus
    }

    /// Start an outgoing call.
    ///
    /// If the call record cannot be created the failure is logged and
    /// returned, and no call is left active.
    pub async fn initiate_call(
        &self,
        receiver_id: UserId,
        call_type: CallType,
    ) -> Result<Call, CallError> {
        if receiver_id == self.user_id {
            return Err(CallError::InvalidPeer(receiver_id));
        }
        self.cleanup_ended_calls().await;

        let mut slots = self.slots.lock().await;
        if let Some(current) = slots.current() {
            return Err(CallError::Busy(current.id.clone()));
        }

        let call = match self
            .services
            .store
            .create(NewCall {
                caller_id: self.user_id.clone(),
                callee_id: receiver_id.clone(),
                call_type,
            })
            .await
        {
            Ok(call) => call,
            Err(e) => {
                warn!("Failed to create call to {}: {}", receiver_id, e);
                return Err(e.into());
            }
        };

        let session = match self.open_session(&call, Role::Caller).await {
            Ok(session) => session,
            Err(e) => {
                warn!("No peer connection for call {}: {}", call.id, e);
                let mut failed = call;
                if let Ok(update) = failed.apply_transition(CallStatus::Failed, Utc::now()) {
                    self.persist(&failed.id, update).await;
                }
                self.remember(&failed).await;
                return Err(e);
            }
        };

        slots.active = Some(call.clone());
        self.remember(&call).await;
        info!(
            "Calling {} ({} call {})",
            receiver_id, call.call_type, call.id
        );

        if self.config.auto_start_media {
            self.start_media(&session, call.call_type).await;
        }
        self.services.cues.play(Cue::Dialing);
        self.event_bus.dispatch(&CallEvent::Outgoing(call.clone()));
        self.send(&call, SignalBody::CallInit { call_type }).await;
        self.arm_ring_timeout(&call.id);

        Ok(call)
    }

    /// Answer the ringing incoming call.
    pub async fn accept_call(&self) -> Result<Call, CallError> {
        let mut slots = self.slots.lock().await;
        let mut call = slots.incoming.clone().ok_or(CallError::NoIncomingCall)?;
        let update = call.apply_transition(CallStatus::Active, Utc::now())?;

        slots.incoming = None;
        self.persist(&call.id, update).await;
        self.services.cues.stop();

        let session = match self.open_session(&call, Role::Callee).await {
            Ok(session) => session,
            Err(e) => {
                warn!("No peer connection for call {}: {}", call.id, e);
                if let Ok(update) = call.apply_transition(CallStatus::Failed, Utc::now()) {
                    self.persist(&call.id, update).await;
                }
                self.settle(&mut slots, &call, Cue::Disconnected).await;
                self.send(&call, SignalBody::CallEnd).await;
                return Err(e);
            }
        };

        slots.active = Some(call.clone());
        self.remember(&call).await;
        info!("Accepted call {} from {}", call.id, call.caller_id);
        self.event_bus
            .dispatch(&CallEvent::StatusChanged(call.clone()));

        if self.config.auto_start_media {
            self.start_media(&session, call.call_type).await;
        }
        self.send(&call, SignalBody::CallAccept).await;

        Ok(call)
    }

    /// Reject the ringing incoming call.
    pub async fn decline_call(&self) -> Result<Call, CallError> {
        let mut slots = self.slots.lock().await;
        let mut call = slots.incoming.clone().ok_or(CallError::NoIncomingCall)?;
        let update = call.apply_transition(CallStatus::Declined, Utc::now())?;

        self.persist(&call.id, update).await;
        info!("Declined call {} from {}", call.id, call.caller_id);
        self.settle(&mut slots, &call, Cue::Declined).await;
        self.send(&call, SignalBody::CallDecline).await;

        Ok(call)
    }

    /// Hang up the active call, or cancel the ringing incoming one.
    pub async fn end_call(&self) -> Result<Call, CallError> {
        let mut slots = self.slots.lock().await;
        let mut call = slots.current().cloned().ok_or(CallError::NoActiveCall)?;
        let update = call.apply_transition(CallStatus::Ended, Utc::now())?;

        self.persist(&call.id, update).await;
        info!(
            "Ended call {} after {}s",
            call.id,
            call.duration_seconds.unwrap_or(0)
        );
        self.settle(&mut slots, &call, Cue::Disconnected).await;
        self.send(&call, SignalBody::CallEnd).await;

        Ok(call)
    }

    /// Acquire a different local stream for the active call, e.g. to share
    /// the screen. Existing senders are reused.
    pub async fn switch_media(&self, kind: CaptureKind) -> Result<(), CallError> {
        let session = self.active_session().await?;
        session.start_local_stream(kind).await?;
        Ok(())
    }

    /// Mute or unmute the active call's local track of `kind`.
    pub async fn set_track_enabled(
        &self,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<bool, CallError> {
        let session = self.active_session().await?;
        Ok(session.set_track_enabled(kind, enabled).await)
    }

    /// Route an inbound signal. Never fails: unexpected signals are dropped.
    pub async fn handle_signal(&self, signal: Signal) {
        if signal.receiver_id != self.user_id {
            debug!(
                "Ignoring {} addressed to {}",
                signal.event(),
                signal.receiver_id
            );
            return;
        }

        match &signal.body {
            SignalBody::CallInit { call_type } => self.on_call_init(&signal, *call_type).await,
            SignalBody::CallAccept => self.on_call_accept(&signal).await,
            SignalBody::CallDecline | SignalBody::CallEnd => self.on_call_terminated(&signal).await,
            SignalBody::Offer { .. } | SignalBody::Answer { .. } | SignalBody::IceCandidate { .. } => {
                self.forward_to_session(&signal).await
            }
        }
    }

    pub async fn handle_session_event(&self, event: SessionEvent) {
        let call_id = event.call_id;
        match event.kind {
            SessionEventKind::ConnectionStateChanged(state) => {
                if state == ConnectionState::Connected {
                    self.services.cues.play(Cue::Connected);
                }
                self.event_bus
                    .dispatch(&CallEvent::ConnectionStateChanged { call_id, state });
            }
            SessionEventKind::RemoteTrack(kind) => {
                self.event_bus
                    .dispatch(&CallEvent::RemoteTrack { call_id, kind });
            }
            SessionEventKind::MediaUnavailable(reason) => {
                self.event_bus
                    .dispatch(&CallEvent::MediaUnavailable { call_id, reason });
            }
            SessionEventKind::Failed(state) => self.fail_call(&call_id, state).await,
        }
    }

    pub async fn active_call(&self) -> Option<Call> {
        self.slots.lock().await.active.clone()
    }

    pub async fn incoming_call(&self) -> Option<Call> {
        self.slots.lock().await.incoming.clone()
    }

    /// Last known state of any call seen by this manager.
    pub async fn get_call(&self, call_id: &CallId) -> Option<Call> {
        self.calls.read().await.get(call_id).cloned()
    }

    pub fn session(&self, call_id: &CallId) -> Option<Arc<NegotiationSession>> {
        self.sessions.get(call_id).map(|s| s.value().clone())
    }

    /// Drop finished calls from the local history.
    pub async fn cleanup_ended_calls(&self) {
        let mut calls = self.calls.write().await;
        calls.retain(|_, call| !call.status.is_terminal());
    }

    /// End any live call and release every session.
    pub async fn shutdown(&self) {
        match self.end_call().await {
            Ok(call) => info!("Ended call {} on shutdown", call.id),
            Err(CallError::NoActiveCall) => {}
            Err(e) => warn!("Failed to end call on shutdown: {}", e),
        }

        let sessions: Vec<Arc<NegotiationSession>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        self.sessions.clear();
        for session in sessions {
            session.cleanup().await;
        }
        self.ring_timers.retain(|_, timer| {
            timer.abort();
            false
        });
    }

    async fn on_call_init(&self, signal: &Signal, call_type: CallType) {
        let mut slots = self.slots.lock().await;
        if slots.find(&signal.call_id).is_some() {
            debug!("Duplicate CALL_INIT for call {}", signal.call_id);
            return;
        }
        if let Some(seen) = self.get_call(&signal.call_id).await {
            debug!(
                "Ignoring CALL_INIT for call {} which is already {}",
                seen.id, seen.status
            );
            return;
        }
        if let Some(current) = slots.current() {
            let current = current.id.clone();
            drop(slots);
            self.reject_busy(signal, &current).await;
            return;
        }

        let fallback = || {
            Call::ringing(
                signal.call_id.clone(),
                NewCall {
                    caller_id: signal.sender_id.clone(),
                    callee_id: signal.receiver_id.clone(),
                    call_type,
                },
                Utc::now(),
            )
        };
        let call = match self.services.store.get(&signal.call_id).await {
            Ok(Some(call)) => call,
            Ok(None) => fallback(),
            Err(e) => {
                warn!(
                    "Failed to load call {}, trusting the invitation: {}",
                    signal.call_id, e
                );
                fallback()
            }
        };
        if call.caller_id != signal.sender_id || call.callee_id != self.user_id {
            warn!(
                "Ignoring CALL_INIT for call {} from {}, who is not its caller",
                call.id, signal.sender_id
            );
            return;
        }
        if call.status.is_terminal() {
            debug!(
                "Ignoring CALL_INIT for call {} which is already {}",
                call.id, call.status
            );
            return;
        }

        info!(
            "Incoming {} call {} from {}",
            call.call_type, call.id, call.caller_id
        );
        slots.incoming = Some(call.clone());
        self.remember(&call).await;
        self.services.cues.play(Cue::Ringtone);
        self.event_bus.dispatch(&CallEvent::Incoming(call));
    }

    async fn reject_busy(&self, signal: &Signal, current: &CallId) {
        if !self.config.auto_decline_when_busy {
            debug!(
                "Dropping CALL_INIT for call {} while in call {}",
                signal.call_id, current
            );
            return;
        }

        info!(
            "Declining call {} from {}: busy with call {}",
            signal.call_id, signal.sender_id, current
        );
        match self.services.store.get(&signal.call_id).await {
            Ok(Some(mut call)) => {
                if let Ok(update) = call.apply_transition(CallStatus::Declined, Utc::now()) {
                    self.persist(&call.id, update).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load call {}: {}", signal.call_id, e),
        }
        self.event_bus.dispatch(&CallEvent::BusyDeclined {
            call_id: signal.call_id.clone(),
            from: signal.sender_id.clone(),
        });
        self.signaling
            .send(Signal::new(
                signal.call_id.clone(),
                self.user_id.clone(),
                signal.sender_id.clone(),
                SignalBody::CallDecline,
            ))
            .await;
    }

    async fn on_call_accept(&self, signal: &Signal) {
        let call = {
            let mut slots = self.slots.lock().await;
            let Some(call) = slots
                .active
                .as_mut()
                .filter(|c| c.id == signal.call_id && c.is_caller(&self.user_id))
            else {
                debug!("Ignoring CALL_ACCEPT for unknown call {}", signal.call_id);
                return;
            };
            if call.status != CallStatus::Ringing {
                debug!("Duplicate CALL_ACCEPT for call {}", call.id);
                return;
            }
            // The callee persists the transition; only the local copy moves.
            if let Err(e) = call.apply_transition(CallStatus::Active, Utc::now()) {
                debug!("Ignoring CALL_ACCEPT: {}", e);
                return;
            }
            call.clone()
        };

        self.cancel_ring_timeout(&call.id);
        self.remember(&call).await;
        self.services.cues.stop();
        info!("Call {} accepted by {}", call.id, call.callee_id);
        self.event_bus
            .dispatch(&CallEvent::StatusChanged(call.clone()));

        self.forward_to_session(signal).await;
    }

    async fn on_call_terminated(&self, signal: &Signal) {
        let mut slots = self.slots.lock().await;
        let Some(tracked) = slots.find(&signal.call_id).cloned() else {
            debug!(
                "Ignoring {} for untracked call {}",
                signal.event(),
                signal.call_id
            );
            return;
        };
        if !tracked.involves(&signal.sender_id) {
            debug!(
                "Ignoring {} for call {} from non-participant {}",
                signal.event(),
                signal.call_id,
                signal.sender_id
            );
            return;
        }

        let (next, cue) = match signal.body {
            SignalBody::CallDecline => (CallStatus::Declined, Cue::Declined),
            _ => (CallStatus::Ended, Cue::Disconnected),
        };

        // The sender already persisted the outcome; prefer its record.
        let call = match self.services.store.get(&signal.call_id).await {
            Ok(Some(stored)) if stored.status.is_terminal() => stored,
            other => {
                if let Err(e) = other {
                    warn!("Failed to load call {}: {}", signal.call_id, e);
                }
                let mut call = tracked;
                if let Err(e) = call.apply_transition(next, Utc::now()) {
                    debug!("Ignoring {}: {}", signal.event(), e);
                    return;
                }
                call
            }
        };

        info!(
            "Call {} {} by {}",
            call.id, call.status, signal.sender_id
        );
        self.settle(&mut slots, &call, cue).await;
    }

    async fn forward_to_session(&self, signal: &Signal) {
        match self.session(&signal.call_id) {
            Some(session) => session.handle_signal(signal).await,
            None => debug!(
                "Dropping {} for call {} with no session",
                signal.event(),
                signal.call_id
            ),
        }
    }

    async fn fail_call(&self, call_id: &CallId, state: ConnectionState) {
        let mut slots = self.slots.lock().await;
        let Some(mut call) = slots.find(call_id).cloned() else {
            debug!("Connection for finished call {} is {}", call_id, state);
            return;
        };
        let update = match call.apply_transition(CallStatus::Failed, Utc::now()) {
            Ok(update) => update,
            Err(e) => {
                debug!("Not failing call {}: {}", call_id, e);
                return;
            }
        };

        warn!("Call {} failed: connection {}", call_id, state);
        self.persist(call_id, update).await;
        self.settle(&mut slots, &call, Cue::Disconnected).await;
        self.send(&call, SignalBody::CallEnd).await;
    }

    async fn expire_ringing(&self, call_id: &CallId) {
        let mut slots = self.slots.lock().await;
        let Some(mut call) = slots
            .active
            .clone()
            .filter(|c| &c.id == call_id && c.status == CallStatus::Ringing)
        else {
            return;
        };
        let Ok(update) = call.apply_transition(CallStatus::Ended, Utc::now()) else {
            return;
        };

        info!("Call {} was not answered, hanging up", call_id);
        self.persist(call_id, update).await;
        self.settle(&mut slots, &call, Cue::Disconnected).await;
        self.send(&call, SignalBody::CallEnd).await;
    }

    /// Bookkeeping shared by every path into a terminal status.
    async fn settle(&self, slots: &mut CallSlots, call: &Call, cue: Cue) {
        slots.clear(&call.id);
        self.remember(call).await;
        self.cancel_ring_timeout(&call.id);
        if let Some((_, session)) = self.sessions.remove(&call.id) {
            session.cleanup().await;
        }
        self.services.cues.stop();
        self.services.cues.play(cue);
        self.event_bus
            .dispatch(&CallEvent::StatusChanged(call.clone()));
    }

    async fn open_session(
        &self,
        call: &Call,
        role: Role,
    ) -> Result<Arc<NegotiationSession>, CallError> {
        let (peer, peer_events) = self
            .services
            .peers
            .create(&self.config.peer_config())
            .await?;
        let session = NegotiationSession::new(
            call,
            self.user_id.clone(),
            role,
            peer,
            peer_events,
            self.services.media.clone(),
            self.signaling.clone(),
            self.session_events.clone(),
        );
        self.sessions.insert(call.id.clone(), session.clone());
        Ok(session)
    }

    async fn active_session(&self) -> Result<Arc<NegotiationSession>, CallError> {
        let call_id = self
            .slots
            .lock()
            .await
            .active
            .as_ref()
            .map(|c| c.id.clone())
            .ok_or(CallError::NoActiveCall)?;
        self.session(&call_id).ok_or(CallError::NotFound(call_id))
    }

    async fn start_media(&self, session: &NegotiationSession, call_type: CallType) {
        // Failures are reported by the session as MediaUnavailable.
        if let Err(e) = session
            .start_local_stream(CaptureKind::for_call(call_type))
            .await
        {
            debug!(
                "Continuing call {} without local media: {}",
                session.call_id(),
                e
            );
        }
    }

    async fn persist(&self, call_id: &CallId, update: CallUpdate) {
        if let Err(e) = self.services.store.update(call_id, update).await {
            warn!("Failed to persist call {}: {}", call_id, e);
        }
    }

    async fn remember(&self, call: &Call) {
        self.calls
            .write()
            .await
            .insert(call.id.clone(), call.clone());
    }

    async fn send(&self, call: &Call, body: SignalBody) {
        self.signaling
            .send(Signal::new(
                call.id.clone(),
                self.user_id.clone(),
                call.peer_of(&self.user_id).clone(),
                body,
            ))
            .await;
    }

    fn arm_ring_timeout(&self, call_id: &CallId) {
        let timeout = self.config.ring_timeout();
        let this = self.this.clone();
        let id = call_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = this.upgrade() {
                // Leave the map first so settling does not abort this task.
                manager.ring_timers.remove(&id);
                manager.expire_ringing(&id).await;
            }
        });
        self.ring_timers.insert(call_id.clone(), timer);
    }

    fn cancel_ring_timeout(&self, call_id: &CallId) {
        if let Some((_, timer)) = self.ring_timers.remove(call_id) {
            timer.abort();
        }
    }

    #[cfg(test)]
    pub(crate) async fn backdate_active_call(&self, by: chrono::Duration) {
        let mut slots = self.slots.lock().await;
        if let Some(started) = slots.active.as_mut().and_then(|c| c.started_at.as_mut()) {
            *started = *started - by;
        }
    }
}
