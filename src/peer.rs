//! Peer connection primitive boundary.
//!
//! The negotiation engine is written entirely against this contract: track
//! attach/replace, offer/answer creation, description setting, candidate
//! application and an event stream carrying negotiation-needed, locally
//! gathered candidates, remote tracks and connection-state changes.

use crate::media::MediaTrack;
use async_trait::async_trait;
use ringcore::types::{ConnectionState, IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("peer connection is closed")]
    Closed,
    #[error("operation invalid in signaling state {0:?}")]
    InvalidState(SignalingState),
    #[error("unknown sender {0:?}")]
    UnknownSender(SenderId),
    #[error("peer connection error: {0}")]
    Other(String),
}

/// Offer/answer state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Handle to an outbound sender created by `add_track`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Relay/reflexive server handed to the connection at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    NegotiationNeeded,
    /// A locally gathered candidate to forward to the remote party.
    IceCandidate(IceCandidate),
    RemoteTrack(MediaTrack),
    ConnectionStateChanged(ConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: MediaTrack) -> Result<SenderId, PeerError>;

    /// Swap the track carried by `sender` without renegotiating.
    async fn replace_track(&self, sender: SenderId, track: MediaTrack) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    fn signaling_state(&self) -> SignalingState;

    fn has_remote_description(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PeerError>;
}
