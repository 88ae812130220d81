//! Platform-agnostic core of the ringside call stack: the call record and its
//! status machine, the signaling wire format and the observable event bus.

pub mod types;
