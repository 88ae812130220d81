//! Per-call media negotiation over a single peer connection.
//!
//! Negotiation is caller-led: the caller queues its local tracks until the
//! callee accepts, then attaches them, which raises negotiation-needed and
//! produces the one OFFER. The callee only ever answers. Signals may arrive
//! duplicated and in any order, so every handler checks the peer's current
//! state instead of trusting arrival order:
//!
//! - a remote description (OFFER or ANSWER) is dropped when its SDP was
//!   applied before or its origin session version is not newer than the
//!   newest one applied, so late redeliveries never roll the connection back;
//! - an OFFER is also dropped while a remote offer is pending, and an ANSWER
//!   is applied only while a local offer is outstanding;
//! - ICE candidates that beat the remote description are queued and drained,
//!   in receipt order, as soon as one is set.

use crate::media::{CaptureKind, LocalStream, MediaError, MediaSource, MediaTrack};
use crate::peer::{PeerConnection, PeerError, PeerEvent, SenderId, SignalingState};
use crate::signaling::SignalingService;
use log::{debug, info, warn};
use ringcore::types::{
    Call, CallId, ConnectionState, IceCandidate, MediaKind, SessionDescription, Signal,
    SignalBody, UserId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Which side of the call this session renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    ConnectionStateChanged(ConnectionState),
    RemoteTrack(MediaKind),
    MediaUnavailable(String),
    /// The connection was lost before the call was ended or declined.
    Failed(ConnectionState),
}

/// Notification from a session to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub call_id: CallId,
    pub kind: SessionEventKind,
}

#[derive(Default)]
struct NegotiationState {
    /// Current local track per kind, attached or still queued.
    local_tracks: HashMap<MediaKind, MediaTrack>,
    senders: HashMap<MediaKind, SenderId>,
    /// Whether local tracks go straight onto the connection.
    attached: bool,
    pending_candidates: VecDeque<IceCandidate>,
    /// SDP of every remote description applied to the connection.
    applied_remote: HashSet<String>,
    /// Newest origin session version among `applied_remote`.
    remote_version: Option<u64>,
    remote_tracks: Vec<MediaTrack>,
    connection_state: ConnectionState,
    closed: bool,
}

impl NegotiationState {
    fn is_stale(&self, desc: &SessionDescription) -> bool {
        if self.applied_remote.contains(&desc.sdp) {
            return true;
        }
        matches!(
            (desc.session_version(), self.remote_version),
            (Some(version), Some(newest)) if version <= newest
        )
    }

    fn record_remote(&mut self, desc: &SessionDescription) {
        self.applied_remote.insert(desc.sdp.clone());
        if let Some(version) = desc.session_version() {
            self.remote_version = Some(
                self.remote_version
                    .map_or(version, |newest| newest.max(version)),
            );
        }
    }
}

pub struct NegotiationSession {
    call_id: CallId,
    local_user: UserId,
    remote_user: UserId,
    role: Role,
    peer: Arc<dyn PeerConnection>,
    media: Arc<dyn MediaSource>,
    signaling: Arc<SignalingService>,
    state: Mutex<NegotiationState>,
    /// Set while an offer is being produced; overlapping triggers are dropped.
    making_offer: AtomicBool,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NegotiationSession {
    /// Wrap `peer` for `call` and start consuming its events.
    ///
    /// Callee sessions attach local tracks as soon as they are started; caller
    /// sessions queue them until [`attach_local_tracks`](Self::attach_local_tracks).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call: &Call,
        local_user: UserId,
        role: Role,
        peer: Arc<dyn PeerConnection>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        media: Arc<dyn MediaSource>,
        signaling: Arc<SignalingService>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let remote_user = call.peer_of(&local_user).clone();
        let session = Arc::new(Self {
            call_id: call.id.clone(),
            local_user,
            remote_user,
            role,
            peer,
            media,
            signaling,
            state: Mutex::new(NegotiationState {
                attached: role == Role::Callee,
                ..Default::default()
            }),
            making_offer: AtomicBool::new(false),
            events_tx,
            pump: std::sync::Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&session);
        let pump = tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.handle_peer_event(event).await;
            }
        });
        *session.pump.lock().expect("Mutex should not be poisoned") = Some(pump);

        debug!(
            "Negotiation session for call {} opened as {:?}",
            session.call_id, role
        );
        session
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Acquire local media of `kind` and put it on the connection.
    ///
    /// A track whose kind already has an outbound sender replaces the sender's
    /// track without renegotiating; the replaced track is stopped. Otherwise the
    /// track is attached (triggering negotiation) or, for a caller that has not
    /// been accepted yet, queued.
    pub async fn start_local_stream(&self, kind: CaptureKind) -> Result<LocalStream, MediaError> {
        let stream = match self.media.acquire(kind).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Local {} stream for call {} failed: {}", kind, self.call_id, e);
                self.emit(SessionEventKind::MediaUnavailable(e.to_string()));
                return Err(e);
            }
        };

        let mut state = self.state.lock().await;
        if state.closed {
            for track in &stream.tracks {
                self.media.stop_track(track);
            }
            return Err(MediaError::Capture(format!(
                "call {} already ended",
                self.call_id
            )));
        }

        for track in &stream.tracks {
            if let Some(sender) = state.senders.get(&track.kind).copied() {
                if let Err(e) = self.peer.replace_track(sender, track.clone()).await {
                    warn!(
                        "Replacing {} track for call {} failed: {}",
                        track.kind, self.call_id, e
                    );
                    self.media.stop_track(track);
                    continue;
                }
            } else if state.attached {
                match self.peer.add_track(track.clone()).await {
                    Ok(sender) => {
                        state.senders.insert(track.kind, sender);
                    }
                    Err(e) => {
                        warn!(
                            "Attaching {} track for call {} failed: {}",
                            track.kind, self.call_id, e
                        );
                        self.media.stop_track(track);
                        continue;
                    }
                }
            }
            if let Some(old) = state.local_tracks.insert(track.kind, track.clone()) {
                self.media.stop_track(&old);
            }
        }

        debug!(
            "Started {} stream {} for call {}",
            kind, stream.id, self.call_id
        );
        Ok(stream)
    }

    /// Put queued local tracks on the connection; tracks started afterwards
    /// are attached directly.
    pub async fn attach_local_tracks(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.attached = true;

        let queued: Vec<MediaTrack> = state
            .local_tracks
            .values()
            .filter(|track| !state.senders.contains_key(&track.kind))
            .cloned()
            .collect();
        if queued.is_empty() {
            debug!("No queued tracks to attach for call {}", self.call_id);
            return;
        }
        for track in queued {
            match self.peer.add_track(track.clone()).await {
                Ok(sender) => {
                    state.senders.insert(track.kind, sender);
                }
                Err(e) => warn!(
                    "Attaching {} track for call {} failed: {}",
                    track.kind, self.call_id, e
                ),
            }
        }
    }

    /// Mute or unmute the local track of `kind`. Returns false if there is none.
    pub async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let state = self.state.lock().await;
        match state.local_tracks.get(&kind) {
            Some(track) => {
                self.media.set_enabled(track, enabled);
                true
            }
            None => false,
        }
    }

    pub async fn handle_signal(&self, signal: &Signal) {
        if signal.call_id != self.call_id {
            debug!(
                "Ignoring {} for call {} in session {}",
                signal.event(),
                signal.call_id,
                self.call_id
            );
            return;
        }
        if signal.sender_id != self.remote_user {
            debug!(
                "Ignoring {} for call {} from unexpected sender {}",
                signal.event(),
                self.call_id,
                signal.sender_id
            );
            return;
        }

        match &signal.body {
            SignalBody::CallAccept => {
                if self.role == Role::Caller {
                    self.attach_local_tracks().await;
                }
            }
            SignalBody::Offer { sdp } => self.apply_offer(sdp).await,
            SignalBody::Answer { sdp } => self.apply_answer(sdp).await,
            SignalBody::IceCandidate { candidate } => self.apply_candidate(candidate).await,
            SignalBody::CallEnd | SignalBody::CallDecline => self.cleanup().await,
            SignalBody::CallInit { .. } => {
                debug!("Ignoring CALL_INIT inside session {}", self.call_id);
            }
        }
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded => self.negotiate().await,
            PeerEvent::IceCandidate(candidate) => {
                if self.state.lock().await.closed {
                    return;
                }
                self.send(SignalBody::IceCandidate { candidate }).await;
            }
            PeerEvent::RemoteTrack(track) => {
                let kind = track.kind;
                {
                    let mut state = self.state.lock().await;
                    if state.closed {
                        return;
                    }
                    state.remote_tracks.retain(|t| t.kind != kind);
                    state.remote_tracks.push(track);
                }
                self.emit(SessionEventKind::RemoteTrack(kind));
            }
            PeerEvent::ConnectionStateChanged(connection) => {
                {
                    let mut state = self.state.lock().await;
                    if state.closed || state.connection_state == connection {
                        return;
                    }
                    state.connection_state = connection;
                }
                info!("Call {} connection is {}", self.call_id, connection);
                self.emit(SessionEventKind::ConnectionStateChanged(connection));

                if connection.is_lost() {
                    self.cleanup().await;
                    self.emit(SessionEventKind::Failed(connection));
                }
            }
        }
    }

    /// Tear the session down: stop local tracks, drop queued candidates and
    /// remote tracks, reset the offer guard, close the connection.
    /// Later calls do nothing.
    pub async fn cleanup(&self) {
        let tracks: Vec<MediaTrack> = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.attached = false;
            state.senders.clear();
            state.pending_candidates.clear();
            state.remote_tracks.clear();
            state.applied_remote.clear();
            state.remote_version = None;
            state.local_tracks.drain().map(|(_, track)| track).collect()
        };

        for track in &tracks {
            self.media.stop_track(track);
        }
        self.making_offer.store(false, Ordering::Release);
        self.peer.close().await;

        if let Some(pump) = self
            .pump
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
        {
            pump.abort();
        }
        info!("Negotiation session for call {} closed", self.call_id);
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.connection_state
    }

    /// Candidates waiting for a remote description, in receipt order.
    pub async fn pending_candidates(&self) -> Vec<IceCandidate> {
        self.state
            .lock()
            .await
            .pending_candidates
            .iter()
            .cloned()
            .collect()
    }

    pub async fn remote_tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().await.remote_tracks.clone()
    }

    pub async fn local_tracks(&self) -> Vec<MediaTrack> {
        self.state
            .lock()
            .await
            .local_tracks
            .values()
            .cloned()
            .collect()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    async fn negotiate(&self) {
        if self.role != Role::Caller {
            debug!("Callee ignores negotiation-needed for call {}", self.call_id);
            return;
        }
        {
            let state = self.state.lock().await;
            if state.closed || !state.attached {
                return;
            }
        }
        if self
            .making_offer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                "Offer already in progress for call {}, dropping trigger",
                self.call_id
            );
            return;
        }

        let result = self.make_offer().await;
        self.making_offer.store(false, Ordering::Release);
        if let Err(e) = result {
            warn!("Creating offer for call {} failed: {}", self.call_id, e);
        }
    }

    async fn make_offer(&self) -> Result<(), PeerError> {
        if self.peer.signaling_state() != SignalingState::Stable {
            debug!(
                "Call {} is mid-negotiation, skipping offer",
                self.call_id
            );
            return Ok(());
        }
        let offer = self.peer.create_offer().await?;

        let state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        self.peer.set_local_description(offer.clone()).await?;
        self.send(SignalBody::Offer { sdp: offer }).await;
        drop(state);

        debug!("Sent offer for call {}", self.call_id);
        Ok(())
    }

    async fn apply_offer(&self, sdp: &SessionDescription) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        if self.peer.signaling_state() == SignalingState::HaveRemoteOffer
            || state.is_stale(sdp)
        {
            debug!("Dropping duplicate or stale offer for call {}", self.call_id);
            return;
        }

        match self.answer_offer(&mut state, sdp).await {
            Ok(answer) => {
                self.send(SignalBody::Answer { sdp: answer }).await;
                debug!("Answered offer for call {}", self.call_id);
            }
            Err(e) => warn!("Answering offer for call {} failed: {}", self.call_id, e),
        }
    }

    async fn answer_offer(
        &self,
        state: &mut NegotiationState,
        sdp: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.peer.set_remote_description(sdp.clone()).await?;
        state.record_remote(sdp);
        self.drain_candidates(state).await;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn apply_answer(&self, sdp: &SessionDescription) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        if self.peer.signaling_state() != SignalingState::HaveLocalOffer {
            debug!(
                "Dropping answer for call {} with no outstanding offer",
                self.call_id
            );
            return;
        }
        if state.is_stale(sdp) {
            debug!(
                "Dropping answer for call {} to an earlier offer",
                self.call_id
            );
            return;
        }
        if let Err(e) = self.peer.set_remote_description(sdp.clone()).await {
            warn!("Applying answer for call {} failed: {}", self.call_id, e);
            return;
        }
        state.record_remote(sdp);
        self.drain_candidates(&mut state).await;
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        if !self.peer.has_remote_description() {
            state.pending_candidates.push_back(candidate.clone());
            debug!(
                "Queued ICE candidate for call {} ({} pending)",
                self.call_id,
                state.pending_candidates.len()
            );
            return;
        }
        if let Err(e) = self.peer.add_ice_candidate(candidate.clone()).await {
            warn!("Applying ICE candidate for call {} failed: {}", self.call_id, e);
        }
    }

    async fn drain_candidates(&self, state: &mut NegotiationState) {
        while let Some(candidate) = state.pending_candidates.pop_front() {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!(
                    "Applying queued ICE candidate for call {} failed: {}",
                    self.call_id, e
                );
            }
        }
    }

    async fn send(&self, body: SignalBody) {
        self.signaling
            .send(Signal::new(
                self.call_id.clone(),
                self.local_user.clone(),
                self.remote_user.clone(),
                body,
            ))
            .await;
    }

    fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            call_id: self.call_id.clone(),
            kind,
        };
        if self.events_tx.send(event).is_err() {
            debug!("Session event for call {} has no receiver", self.call_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::memory::{MemoryChannel, SimulatedMedia, SimulatedPeer, SimulatedPeerFactory};
    use crate::peer::{PeerConfig, PeerConnectionFactory};
    use chrono::Utc;
    use ringcore::types::{CallType, NewCall};
    use std::time::Duration;

    struct Harness {
        session: Arc<NegotiationSession>,
        peer: Arc<SimulatedPeer>,
        media: Arc<SimulatedMedia>,
        channel: Arc<MemoryChannel>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn test_call() -> Call {
        Call::ringing(
            CallId::new("CALL1"),
            NewCall {
                caller_id: UserId::new("user1"),
                callee_id: UserId::new("user2"),
                call_type: CallType::Video,
            },
            Utc::now(),
        )
    }

    async fn harness(role: Role) -> Harness {
        let channel = Arc::new(MemoryChannel::new());
        let signaling = Arc::new(SignalingService::new(
            channel.clone(),
            SignalingConfig::default(),
        ));
        let factory = SimulatedPeerFactory::new();
        let (peer, peer_events) = factory.create(&PeerConfig::default()).await.unwrap();
        let media = Arc::new(SimulatedMedia::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        let local = match role {
            Role::Caller => UserId::new("user1"),
            Role::Callee => UserId::new("user2"),
        };
        let session = NegotiationSession::new(
            &test_call(),
            local,
            role,
            peer,
            peer_events,
            media.clone(),
            signaling,
            events_tx,
        );
        Harness {
            session,
            peer: factory.last().unwrap(),
            media,
            channel,
            events,
        }
    }

    fn from_caller(body: SignalBody) -> Signal {
        Signal::new(
            CallId::new("CALL1"),
            UserId::new("user1"),
            UserId::new("user2"),
            body,
        )
    }

    fn from_callee(body: SignalBody) -> Signal {
        Signal::new(
            CallId::new("CALL1"),
            UserId::new("user2"),
            UserId::new("user1"),
            body,
        )
    }

    fn candidate(n: u32) -> SignalBody {
        SignalBody::IceCandidate {
            candidate: IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host")),
        }
    }

    fn offer(sdp: &str) -> SignalBody {
        SignalBody::Offer {
            sdp: SessionDescription::offer(sdp),
        }
    }

    fn durable_count(channel: &MemoryChannel, event: &str) -> usize {
        channel
            .rows()
            .iter()
            .filter(|row| row.payload["event"] == event)
            .count()
    }

    async fn wait_for(what: &str, check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEventKind {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("session event within a second")
            .expect("event channel open")
            .kind
    }

    #[tokio::test]
    async fn test_early_candidates_are_applied_once_in_order() {
        let h = harness(Role::Callee).await;
        for n in 1..=3 {
            h.session.handle_signal(&from_caller(candidate(n))).await;
        }
        assert_eq!(h.session.pending_candidates().await.len(), 3);
        assert!(h.peer.applied_candidates().is_empty());

        h.session
            .handle_signal(&from_caller(offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\n")))
            .await;

        let applied: Vec<String> = h
            .peer
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied.len(), 3);
        assert!(applied[0].starts_with("candidate:1 "));
        assert!(applied[1].starts_with("candidate:2 "));
        assert!(applied[2].starts_with("candidate:3 "));
        assert!(h.session.pending_candidates().await.is_empty());

        // Later candidates go straight through.
        h.session.handle_signal(&from_caller(candidate(4))).await;
        assert_eq!(h.peer.applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_offer_is_answered_once() {
        let h = harness(Role::Callee).await;
        let signal = from_caller(offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\n"));

        h.session.handle_signal(&signal).await;
        h.session.handle_signal(&signal).await;

        assert_eq!(h.peer.answers_created(), 1);
        assert_eq!(durable_count(&h.channel, "ANSWER"), 1);
        assert_eq!(h.peer.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_changed_offer_renegotiates() {
        let h = harness(Role::Callee).await;
        h.session
            .handle_signal(&from_caller(offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\n")))
            .await;
        h.session
            .handle_signal(&from_caller(offer(
                "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
            )))
            .await;

        assert_eq!(h.peer.answers_created(), 2);
        assert_eq!(durable_count(&h.channel, "ANSWER"), 2);
    }

    #[tokio::test]
    async fn test_late_offer_after_renegotiation_is_dropped() {
        let h = harness(Role::Callee).await;
        let first = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\n";
        let second = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\n\
                      m=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        let rewritten = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

        h.session.handle_signal(&from_caller(offer(first))).await;
        h.session.handle_signal(&from_caller(offer(second))).await;
        // The durable copy of the first offer shows up after the renegotiation.
        h.session.handle_signal(&from_caller(offer(first))).await;
        h.session.handle_signal(&from_caller(offer(rewritten))).await;

        assert_eq!(h.peer.answers_created(), 2);
        assert_eq!(durable_count(&h.channel, "ANSWER"), 2);
        assert_eq!(h.peer.remote_description().unwrap().sdp, second);
        assert_eq!(h.peer.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_stale_answer_does_not_complete_renegotiation() {
        let h = harness(Role::Caller).await;
        h.session.attach_local_tracks().await;
        h.session.start_local_stream(CaptureKind::Audio).await.unwrap();
        wait_for("first offer", || durable_count(&h.channel, "OFFER") == 1).await;

        let first = SessionDescription::answer(
            "v=0\r\no=- 9 1 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\n",
        );
        h.session
            .handle_signal(&from_callee(SignalBody::Answer { sdp: first.clone() }))
            .await;
        assert_eq!(h.peer.signaling_state(), SignalingState::Stable);

        // Adding the camera renegotiates.
        h.session.start_local_stream(CaptureKind::Video).await.unwrap();
        wait_for("second offer", || durable_count(&h.channel, "OFFER") == 2).await;
        assert_eq!(h.peer.signaling_state(), SignalingState::HaveLocalOffer);

        h.session
            .handle_signal(&from_callee(SignalBody::Answer { sdp: first.clone() }))
            .await;
        assert_eq!(h.peer.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(h.peer.remote_description(), Some(first));

        let second = SessionDescription::answer(
            "v=0\r\no=- 9 2 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
        );
        h.session
            .handle_signal(&from_callee(SignalBody::Answer { sdp: second.clone() }))
            .await;
        assert_eq!(h.peer.signaling_state(), SignalingState::Stable);
        assert_eq!(h.peer.remote_description(), Some(second));
    }

    #[tokio::test]
    async fn test_stray_answer_is_ignored() {
        let h = harness(Role::Caller).await;
        h.session
            .handle_signal(&from_callee(SignalBody::Answer {
                sdp: SessionDescription::answer("v=0"),
            }))
            .await;

        assert!(!h.peer.has_remote_description());
        assert_eq!(h.peer.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_signals_for_other_calls_are_discarded() {
        let h = harness(Role::Callee).await;
        let stray = Signal::new(
            CallId::new("X"),
            UserId::new("user1"),
            UserId::new("user2"),
            candidate(1),
        );
        h.session.handle_signal(&stray).await;

        let impostor = Signal::new(
            CallId::new("CALL1"),
            UserId::new("user3"),
            UserId::new("user2"),
            SignalBody::CallEnd,
        );
        h.session.handle_signal(&impostor).await;

        assert!(h.session.pending_candidates().await.is_empty());
        assert!(!h.session.is_closed().await);
    }

    #[tokio::test]
    async fn test_caller_queues_tracks_until_accept() {
        let h = harness(Role::Caller).await;
        h.session.start_local_stream(CaptureKind::Video).await.unwrap();
        assert!(h.peer.sender_tracks().is_empty());
        assert_eq!(h.session.local_tracks().await.len(), 2);

        h.session
            .handle_signal(&from_callee(SignalBody::CallAccept))
            .await;
        assert_eq!(h.peer.sender_tracks().len(), 2);

        wait_for("offer after accept", || durable_count(&h.channel, "OFFER") == 1).await;
        assert_eq!(h.peer.offers_created(), 1);
        assert_eq!(h.peer.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_overlapping_negotiation_triggers_make_one_offer() {
        let h = harness(Role::Caller).await;
        h.session.attach_local_tracks().await;
        h.peer.set_offer_delay(Duration::from_millis(50));

        tokio::join!(
            h.session.handle_peer_event(PeerEvent::NegotiationNeeded),
            h.session.handle_peer_event(PeerEvent::NegotiationNeeded),
        );

        assert_eq!(h.peer.offers_created(), 1);
        assert_eq!(durable_count(&h.channel, "OFFER"), 1);
    }

    #[tokio::test]
    async fn test_call_end_during_offer_aborts_negotiation() {
        let h = harness(Role::Caller).await;
        let stream = h.session.start_local_stream(CaptureKind::Video).await.unwrap();
        h.peer.set_offer_delay(Duration::from_millis(50));
        h.session.attach_local_tracks().await;

        let call_end = from_callee(SignalBody::CallEnd);
        tokio::join!(
            h.session.handle_peer_event(PeerEvent::NegotiationNeeded),
            h.session.handle_signal(&call_end),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(h.session.is_closed().await);
        assert_eq!(durable_count(&h.channel, "OFFER"), 0);
        assert_eq!(h.peer.offers_created(), 0);
        assert_eq!(h.peer.close_calls(), 1);

        let mut stopped = h.media.stopped();
        stopped.sort();
        let mut started: Vec<String> = stream.tracks.iter().map(|t| t.id.clone()).collect();
        started.sort();
        assert_eq!(stopped, started);
    }

    #[tokio::test]
    async fn test_local_candidates_are_signalled() {
        let h = harness(Role::Callee).await;
        h.peer.gather_candidate();

        wait_for("ICE_CANDIDATE broadcast", || {
            h.channel.published_count("call-signaling:user1") == 1
        })
        .await;
        assert!(h.channel.rows().is_empty());
    }

    #[tokio::test]
    async fn test_callee_never_offers() {
        let h = harness(Role::Callee).await;
        h.session
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;
        assert_eq!(h.peer.offers_created(), 0);
    }

    #[tokio::test]
    async fn test_restarting_stream_replaces_sender_track() {
        let h = harness(Role::Callee).await;
        let first = h.session.start_local_stream(CaptureKind::Audio).await.unwrap();
        let second = h.session.start_local_stream(CaptureKind::Audio).await.unwrap();

        let senders = h.peer.sender_tracks();
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].id, second.tracks[0].id);
        assert_eq!(h.media.stopped(), vec![first.tracks[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_screen_share_replaces_camera() {
        let h = harness(Role::Callee).await;
        let camera = h.session.start_local_stream(CaptureKind::Video).await.unwrap();
        let screen = h.session.start_local_stream(CaptureKind::Screen).await.unwrap();

        let video_sender = h
            .peer
            .sender_tracks()
            .into_iter()
            .find(|t| t.kind == MediaKind::Video)
            .unwrap();
        assert_eq!(video_sender.label, "screen");
        assert_eq!(video_sender.id, screen.tracks[0].id);
        assert_eq!(h.peer.sender_tracks().len(), 2);
        assert_eq!(
            h.media.stopped(),
            vec![camera.track(MediaKind::Video).unwrap().id.clone()]
        );
    }

    #[tokio::test]
    async fn test_denied_media_is_reported() {
        let mut h = harness(Role::Caller).await;
        h.media.deny(CaptureKind::Video);

        let err = h
            .session
            .start_local_stream(CaptureKind::Video)
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied(CaptureKind::Video));
        assert!(matches!(
            next_event(&mut h.events).await,
            SessionEventKind::MediaUnavailable(_)
        ));

        h.media.allow(CaptureKind::Video);
        let stream = h.session.start_local_stream(CaptureKind::Video).await.unwrap();
        assert_eq!(stream.tracks.len(), 2);
    }

    #[tokio::test]
    async fn test_mute_toggles_local_track() {
        let h = harness(Role::Callee).await;
        let stream = h.session.start_local_stream(CaptureKind::Audio).await.unwrap();
        let mic = &stream.tracks[0].id;

        assert!(h.session.set_track_enabled(MediaKind::Audio, false).await);
        assert!(!h.media.is_enabled(mic));
        assert!(h.session.set_track_enabled(MediaKind::Audio, true).await);
        assert!(h.media.is_enabled(mic));
        assert!(!h.session.set_track_enabled(MediaKind::Video, false).await);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let h = harness(Role::Callee).await;
        h.session.start_local_stream(CaptureKind::Video).await.unwrap();
        h.session.handle_signal(&from_caller(candidate(1))).await;

        h.session.cleanup().await;
        h.session.cleanup().await;

        assert!(h.session.is_closed().await);
        assert_eq!(h.media.stopped().len(), 2);
        assert_eq!(h.peer.close_calls(), 1);
        assert!(h.session.pending_candidates().await.is_empty());
        assert!(h.session.local_tracks().await.is_empty());
    }

    #[tokio::test]
    async fn test_call_end_tears_down_session() {
        let h = harness(Role::Callee).await;
        h.session.start_local_stream(CaptureKind::Audio).await.unwrap();
        h.session.handle_signal(&from_caller(SignalBody::CallEnd)).await;

        assert!(h.session.is_closed().await);
        assert_eq!(h.media.stopped().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_cleans_up_and_reports() {
        let mut h = harness(Role::Callee).await;
        h.session.start_local_stream(CaptureKind::Audio).await.unwrap();
        h.peer.force_connection_state(ConnectionState::Failed);

        assert_eq!(
            next_event(&mut h.events).await,
            SessionEventKind::ConnectionStateChanged(ConnectionState::Failed)
        );
        assert_eq!(
            next_event(&mut h.events).await,
            SessionEventKind::Failed(ConnectionState::Failed)
        );
        assert!(h.session.is_closed().await);
        assert_eq!(h.media.stopped().len(), 1);
    }
}
