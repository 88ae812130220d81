use crate::media::MediaTrack;
use crate::peer::{
    PeerConfig, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, SenderId,
    SignalingState,
};
use async_trait::async_trait;
use ringcore::types::{ConnectionState, IceCandidate, MediaKind, SdpType, SessionDescription};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct PeerState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: BTreeMap<u64, MediaTrack>,
    next_sender: u64,
    negotiation_pending: bool,
    remote_kinds: HashSet<MediaKind>,
    applied_candidates: Vec<IceCandidate>,
    gathered: u32,
    sdp_version: u32,
    offers_created: usize,
    answers_created: usize,
    offer_delay: Option<Duration>,
    close_calls: usize,
}

/// Peer connection that negotiates with fake SDP and "connects" as soon as
/// an offer/answer exchange completes.
///
/// Like a browser connection it coalesces negotiation-needed while one is
/// pending, refuses candidates until a remote description exists and does
/// not emit a state change when closed locally.
pub struct SimulatedPeer {
    id: u64,
    config: PeerConfig,
    state: Mutex<PeerState>,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl SimulatedPeer {
    fn new(id: u64, config: PeerConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id,
            config,
            state: Mutex::new(PeerState::default()),
            events: Mutex::new(Some(tx)),
        });
        (peer, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    fn emit(&self, event: PeerEvent) {
        if let Some(tx) = self
            .events
            .lock()
            .expect("Mutex should not be poisoned")
            .as_ref()
        {
            let _ = tx.send(event);
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Delay `create_offer` to widen the window for overlapping triggers.
    pub fn set_offer_delay(&self, delay: Duration) {
        self.lock().offer_delay = Some(delay);
    }

    /// Report a connection-state change as the network would.
    pub fn force_connection_state(&self, state: ConnectionState) {
        self.lock().connection = state;
        self.emit(PeerEvent::ConnectionStateChanged(state));
    }

    /// Deliver a remote candidate-gathering event, as if ICE found a path.
    pub fn gather_candidate(&self) {
        let candidate = {
            let mut state = self.lock();
            state.gathered += 1;
            host_candidate(self.id, state.gathered)
        };
        self.emit(PeerEvent::IceCandidate(candidate));
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().applied_candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.lock().offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.lock().answers_created
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    /// Tracks currently carried by outbound senders.
    pub fn sender_tracks(&self) -> Vec<MediaTrack> {
        self.lock().senders.values().cloned().collect()
    }

    fn build_sdp(&self, state: &mut PeerState) -> String {
        state.sdp_version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id, state.sdp_version
        );
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if !state.senders.values().any(|t| t.kind == kind) {
                continue;
            }
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\n"));
        }
        sdp
    }

    /// After an exchange completes, emit remote tracks and connect once.
    fn after_description(&self, state: &mut PeerState, events: &mut Vec<PeerEvent>) {
        if let Some(remote) = &state.remote {
            for kind in media_kinds(&remote.sdp) {
                if state.remote_kinds.insert(kind) {
                    events.push(PeerEvent::RemoteTrack(MediaTrack {
                        id: format!("remote-{}-{kind}", self.id),
                        kind,
                        label: format!("remote {kind}"),
                    }));
                }
            }
        }
        let exchanged = state.local.is_some() && state.remote.is_some();
        if exchanged
            && state.signaling == SignalingState::Stable
            && state.connection == ConnectionState::New
        {
            state.connection = ConnectionState::Connected;
            events.push(PeerEvent::ConnectionStateChanged(ConnectionState::Connecting));
            events.push(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
        }
    }
}

fn host_candidate(peer: u64, n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!(
            "candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host",
            40000 + peer * 100 + u64::from(n)
        ),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

fn media_kinds(sdp: &str) -> Vec<MediaKind> {
    sdp.lines()
        .filter_map(|line| match line.split_whitespace().next() {
            Some("m=audio") => Some(MediaKind::Audio),
            Some("m=video") => Some(MediaKind::Video),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl PeerConnection for SimulatedPeer {
    async fn add_track(&self, track: MediaTrack) -> Result<SenderId, PeerError> {
        let (id, notify) = {
            let mut state = self.lock();
            if state.signaling == SignalingState::Closed {
                return Err(PeerError::Closed);
            }
            state.next_sender += 1;
            let id = state.next_sender;
            state.senders.insert(id, track);
            let notify = !state.negotiation_pending;
            state.negotiation_pending = true;
            (id, notify)
        };
        if notify {
            self.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(SenderId(id))
    }

    async fn replace_track(&self, sender: SenderId, track: MediaTrack) -> Result<(), PeerError> {
        let mut state = self.lock();
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        match state.senders.get_mut(&sender.0) {
            Some(slot) => {
                *slot = track;
                Ok(())
            }
            None => Err(PeerError::UnknownSender(sender)),
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let delay = self.lock().offer_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        state.negotiation_pending = false;
        state.offers_created += 1;
        Ok(SessionDescription::offer(self.build_sdp(&mut state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState(state.signaling));
        }
        state.negotiation_pending = false;
        state.answers_created += 1;
        Ok(SessionDescription::answer(self.build_sdp(&mut state)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            state.signaling = match (state.signaling, desc.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (SignalingState::Closed, _) => return Err(PeerError::Closed),
                (current, _) => return Err(PeerError::InvalidState(current)),
            };
            state.local = Some(desc);
            state.gathered += 1;
            events.push(PeerEvent::IceCandidate(host_candidate(
                self.id,
                state.gathered,
            )));
            self.after_description(&mut state, &mut events);
        }
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            state.signaling = match (state.signaling, desc.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                (SignalingState::Closed, _) => return Err(PeerError::Closed),
                (current, _) => return Err(PeerError::InvalidState(current)),
            };
            state.remote = Some(desc);
            self.after_description(&mut state, &mut events);
        }
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.lock();
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        if state.remote.is_none() {
            return Err(PeerError::InvalidState(state.signaling));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.lock().signaling
    }

    fn has_remote_description(&self) -> bool {
        self.lock().remote.is_some()
    }

    async fn close(&self) {
        {
            let mut state = self.lock();
            state.close_calls += 1;
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
        }
        self.events
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
    }
}

/// Creates [`SimulatedPeer`]s and keeps a handle to each for inspection.
#[derive(Default)]
pub struct SimulatedPeerFactory {
    next_id: AtomicU64,
    peers: Mutex<Vec<Arc<SimulatedPeer>>>,
    fail_creates: Mutex<bool>,
}

impl SimulatedPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_creates(&self, fail: bool) {
        *self.fail_creates.lock().expect("Mutex should not be poisoned") = fail;
    }

    pub fn peers(&self) -> Vec<Arc<SimulatedPeer>> {
        self.peers
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    pub fn last(&self) -> Option<Arc<SimulatedPeer>> {
        self.peers
            .lock()
            .expect("Mutex should not be poisoned")
            .last()
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for SimulatedPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        if *self.fail_creates.lock().expect("Mutex should not be poisoned") {
            return Err(PeerError::Other("no ICE servers reachable".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (peer, events) = SimulatedPeer::new(id, config.clone());
        self.peers
            .lock()
            .expect("Mutex should not be poisoned")
            .push(peer.clone());
        Ok((peer, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(kind: MediaKind) -> MediaTrack {
        MediaTrack {
            id: format!("t-{kind}"),
            kind,
            label: kind.to_string(),
        }
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let factory = SimulatedPeerFactory::new();
        let (a, mut a_events) = factory.create(&PeerConfig::default()).await.unwrap();
        let (b, _b_events) = factory.create(&PeerConfig::default()).await.unwrap();

        a.add_track(track(MediaKind::Audio)).await.unwrap();
        a.add_track(track(MediaKind::Video)).await.unwrap();
        assert!(matches!(
            a_events.try_recv(),
            Ok(PeerEvent::NegotiationNeeded)
        ));
        // Coalesced: only one negotiation-needed for both tracks.
        assert!(a_events.try_recv().is_err());

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(factory.peers()[1].connection_state(), ConnectionState::Connected);
        assert_eq!(factory.peers()[0].connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let factory = SimulatedPeerFactory::new();
        let (peer, _events) = factory.create(&PeerConfig::default()).await.unwrap();
        assert!(
            peer.add_ice_candidate(IceCandidate::new("candidate:1"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_stray_answer_is_rejected() {
        let factory = SimulatedPeerFactory::new();
        let (peer, _events) = factory.create(&PeerConfig::default()).await.unwrap();
        let err = peer
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert_eq!(err, PeerError::InvalidState(SignalingState::Stable));
    }
}
