pub mod call;
pub mod events;
pub mod media;
pub mod signal;

pub use call::{
    Call, CallId, CallStatus, CallType, CallUpdate, InvalidTransition, NewCall, UserId,
};
pub use events::{CallEvent, CallEventBus, CallEventHandler};
pub use media::{ConnectionState, MediaKind};
pub use signal::{
    IceCandidate, SdpType, SessionDescription, Signal, SignalBody, SignalDecodeError, SignalEvent,
};
