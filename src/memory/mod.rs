//! In-process implementations of every external boundary.
//!
//! Two clients sharing one [`MemoryChannel`] and one [`MemoryCallStore`] can
//! call each other inside a single process. Each type exposes knobs to inject
//! the failures the call layer must tolerate (lost broadcasts, failed sends,
//! failed record creation, denied devices, dropped connections).

mod channel;
mod media;
mod peer;
mod store;

pub use channel::MemoryChannel;
pub use media::SimulatedMedia;
pub use peer::{SimulatedPeer, SimulatedPeerFactory};
pub use store::MemoryCallStore;
