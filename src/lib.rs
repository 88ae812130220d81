// Platform-agnostic call types live in ringcore and are re-exported here
pub use ringcore::types;

// External boundaries
pub mod channel;
pub mod cues;
pub mod media;
pub mod peer;
pub mod store;

// Call layer
pub mod calls;
pub mod signaling;

pub mod client;
pub mod config;
pub mod memory;

pub use calls::{CallError, CallManager, NegotiationSession};
pub use client::{CallClient, CallClientBuilder};
pub use config::CallConfig;

#[cfg(test)]
mod test_utils;
