//! Fire-and-forget sound cues played on call transitions.

use log::debug;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    /// Incoming call is ringing.
    Ringtone,
    /// Outgoing call is waiting for an answer.
    Dialing,
    Connected,
    Disconnected,
    Declined,
}

impl fmt::Display for Cue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ringtone => "ringtone",
            Self::Dialing => "dialing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Declined => "declined",
        })
    }
}

pub trait SoundCues: Send + Sync {
    fn play(&self, cue: Cue);

    /// Silence any looping cue (ringtone, dialing tone).
    fn stop(&self) {}
}

/// Cues that only show up in the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCues;

impl SoundCues for LogCues {
    fn play(&self, cue: Cue) {
        debug!("cue: {cue}");
    }

    fn stop(&self) {
        debug!("cue: stop");
    }
}
