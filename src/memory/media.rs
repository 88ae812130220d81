use crate::media::{CaptureKind, LocalStream, MediaError, MediaSource, MediaTrack};
use async_trait::async_trait;
use ringcore::types::MediaKind;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct MediaState {
    denied: HashSet<CaptureKind>,
    stopped: Vec<String>,
    disabled: HashSet<String>,
}

/// Hands out synthetic tracks and records what was stopped or muted.
#[derive(Default)]
pub struct SimulatedMedia {
    next_id: AtomicU64,
    state: Mutex<MediaState>,
}

impl SimulatedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MediaState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    /// Refuse captures of `kind` as if the user denied permission.
    pub fn deny(&self, kind: CaptureKind) {
        self.lock().denied.insert(kind);
    }

    pub fn allow(&self, kind: CaptureKind) {
        self.lock().denied.remove(&kind);
    }

    /// Ids of stopped tracks, one entry per stop call.
    pub fn stopped(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    pub fn is_enabled(&self, track_id: &str) -> bool {
        !self.lock().disabled.contains(track_id)
    }

    fn track(&self, kind: MediaKind, label: &str) -> MediaTrack {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        MediaTrack {
            id: format!("{kind}-{n}"),
            kind,
            label: label.to_string(),
        }
    }
}

#[async_trait]
impl MediaSource for SimulatedMedia {
    async fn acquire(&self, kind: CaptureKind) -> Result<LocalStream, MediaError> {
        if self.lock().denied.contains(&kind) {
            return Err(MediaError::PermissionDenied(kind));
        }
        let tracks = match kind {
            CaptureKind::Audio => vec![self.track(MediaKind::Audio, "microphone")],
            CaptureKind::Video => vec![
                self.track(MediaKind::Audio, "microphone"),
                self.track(MediaKind::Video, "camera"),
            ],
            CaptureKind::Screen => vec![self.track(MediaKind::Video, "screen")],
        };
        Ok(LocalStream {
            id: format!("stream-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            capture: kind,
            tracks,
        })
    }

    fn stop_track(&self, track: &MediaTrack) {
        self.lock().stopped.push(track.id.clone());
    }

    fn set_enabled(&self, track: &MediaTrack, enabled: bool) {
        let mut state = self.lock();
        if enabled {
            state.disabled.remove(&track.id);
        } else {
            state.disabled.insert(track.id.clone());
        }
    }
}
