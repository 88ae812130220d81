//! Call record and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of a user on the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Opaque call identifier, assigned when the record is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random 32 hex-character identifier.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Desired initial media configuration of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Audio,
    Video,
    Screen,
    Mixed,
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
            Self::Mixed => "mixed",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "screen" => Ok(Self::Screen),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!("unknown call type: {other}")),
        }
    }
}

/// Lifecycle status of a call.
///
/// `Ringing` is the initial status. `Ended`, `Declined` and `Failed` are
/// terminal: no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Ringing,
    Active,
    Ended,
    Declined,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Failed)
    }

    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Ringing, Active)
                | (Ringing, Declined)
                | (Ringing, Ended)
                | (Ringing, Failed)
                | (Active, Ended)
                | (Active, Failed)
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Fields needed to create a call record; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCall {
    pub caller_id: UserId,
    pub callee_id: UserId,
    #[serde(rename = "type")]
    pub call_type: CallType,
}

/// Status and timestamp changes to persist for an existing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUpdate {
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

/// One attempted or ongoing call between two parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl Call {
    /// A fresh ringing call.
    pub fn ringing(id: CallId, new_call: NewCall, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            caller_id: new_call.caller_id,
            callee_id: new_call.callee_id,
            call_type: new_call.call_type,
            status: CallStatus::Ringing,
            created_at,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
        }
    }

    pub fn is_caller(&self, user: &UserId) -> bool {
        &self.caller_id == user
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.callee_id == user
    }

    /// The party on the other side from `user`.
    pub fn peer_of(&self, user: &UserId) -> &UserId {
        if self.is_caller(user) {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }

    /// Move to `next`, stamping timestamps, and return the update to persist.
    ///
    /// Entering `Active` records `started_at`. Entering a terminal status
    /// records `ended_at` and `duration_seconds`, which is measured from
    /// `started_at` and is zero for calls that never became active.
    pub fn apply_transition(
        &mut self,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> Result<CallUpdate, InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                call_id: self.id.clone(),
                current: self.status,
                attempted: next,
            });
        }

        let mut update = CallUpdate {
            status: next,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
        };

        if next == CallStatus::Active {
            self.started_at = Some(at);
            update.started_at = Some(at);
        } else if next.is_terminal() {
            let duration = self
                .started_at
                .map(|started| at.signed_duration_since(started).num_seconds().max(0))
                .unwrap_or(0);
            self.ended_at = Some(at);
            self.duration_seconds = Some(duration);
            update.ended_at = Some(at);
            update.duration_seconds = Some(duration);
        }

        self.status = next;
        Ok(update)
    }

    /// Apply an update produced elsewhere (e.g. read back from the store).
    pub fn merge(&mut self, update: &CallUpdate) {
        self.status = update.status;
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.ended_at.is_some() {
            self.ended_at = update.ended_at;
        }
        if update.duration_seconds.is_some() {
            self.duration_seconds = update.duration_seconds;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {current} -> {attempted} for call {call_id}")]
pub struct InvalidTransition {
    pub call_id: CallId,
    pub current: CallStatus,
    pub attempted: CallStatus,
}
