use super::call::{Call, CallId, UserId};
use super::media::{ConnectionState, MediaKind};
use std::sync::{Arc, RwLock};

/// Observable call-layer notifications.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// We created a call and the invitation is on its way.
    Outgoing(Call),
    /// A call invitation arrived and occupies the incoming slot.
    Incoming(Call),
    /// The call's status changed (accepted, declined, ended, failed).
    StatusChanged(Call),
    /// A second invitation arrived while busy and was declined.
    BusyDeclined { call_id: CallId, from: UserId },
    ConnectionStateChanged {
        call_id: CallId,
        state: ConnectionState,
    },
    RemoteTrack { call_id: CallId, kind: MediaKind },
    /// Local media could not be acquired; the call itself continues.
    MediaUnavailable { call_id: CallId, reason: String },
}

impl CallEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Outgoing(call) | Self::Incoming(call) | Self::StatusChanged(call) => &call.id,
            Self::BusyDeclined { call_id, .. }
            | Self::ConnectionStateChanged { call_id, .. }
            | Self::RemoteTrack { call_id, .. }
            | Self::MediaUnavailable { call_id, .. } => call_id,
        }
    }
}

pub trait CallEventHandler: Send + Sync {
    fn handle_event(&self, event: &CallEvent);
}

impl<F> CallEventHandler for F
where
    F: Fn(&CallEvent) + Send + Sync,
{
    fn handle_event(&self, event: &CallEvent) {
        self(event)
    }
}

#[derive(Default, Clone)]
pub struct CallEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn CallEventHandler>>>>,
}

impl CallEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn CallEventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn dispatch(&self, event: &CallEvent) {
        let handlers = self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .clone();
        for handler in handlers {
            handler.handle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_reaches_every_handler() {
        let bus = CallEventBus::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            bus.add_handler(Arc::new(move |event: &CallEvent| {
                seen.lock()
                    .unwrap()
                    .push(format!("{tag}:{}", event.call_id()));
            }));
        }

        bus.dispatch(&CallEvent::MediaUnavailable {
            call_id: CallId::new("X"),
            reason: "denied".into(),
        });

        assert_eq!(*seen.lock().unwrap(), vec!["a:X", "b:X"]);
    }
}
