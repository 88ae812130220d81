//! Media acquisition boundary: "give me a stream of kind K".

use async_trait::async_trait;
use ringcore::types::{CallType, MediaKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// What to capture when starting a local stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Microphone only.
    Audio,
    /// Microphone and camera.
    Video,
    /// Screen capture.
    Screen,
}

impl CaptureKind {
    /// Capture used to start a call of the given type.
    pub fn for_call(call_type: CallType) -> Self {
        match call_type {
            CallType::Audio => Self::Audio,
            CallType::Video | CallType::Mixed => Self::Video,
            CallType::Screen => Self::Screen,
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to capture {0} was denied")]
    PermissionDenied(CaptureKind),
    #[error("no {0} device available")]
    NoDevice(CaptureKind),
    #[error("capture failed: {0}")]
    Capture(String),
}

/// One captured track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

/// A set of tracks captured together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub capture: CaptureKind,
    pub tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, kind: CaptureKind) -> Result<LocalStream, MediaError>;

    /// Release the device behind `track`.
    fn stop_track(&self, track: &MediaTrack);

    /// Mute or unmute `track` without releasing it.
    fn set_enabled(&self, track: &MediaTrack, enabled: bool);
}
