//! One-to-one calls: lifecycle management and media negotiation.
//!
//! # Architecture
//!
//! - [`CallManager`]: owns the call slots (at most one active and one
//!   incoming call), persists status changes and reacts to inbound signals.
//! - [`NegotiationSession`]: one per live call, wraps exactly one peer
//!   connection and runs the caller-led offer/answer exchange.
//!
//! Sessions report upward through [`SessionEvent`]s on a channel; they never
//! call back into the manager directly.

mod error;
mod manager;
mod negotiation;

pub use error::CallError;
pub use manager::{CallManager, CallServices};
pub use negotiation::{NegotiationSession, Role, SessionEvent, SessionEventKind};
