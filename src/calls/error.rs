//! Call-related error types.

use crate::media::MediaError;
use crate::peer::PeerError;
use crate::store::StoreError;
use ringcore::types::{CallId, InvalidTransition, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error("no active or incoming call")]
    NoActiveCall,

    #[error("already in a call: {0}")]
    Busy(CallId),

    #[error("cannot call {0}")]
    InvalidPeer(UserId),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("call store error: {0}")]
    Store(#[from] StoreError),

    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),
}
