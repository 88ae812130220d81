use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::calls::CallManager;
use crate::client::CallClient;
use crate::config::CallConfig;
use crate::cues::{Cue, SoundCues};
use crate::memory::{MemoryCallStore, MemoryChannel, SimulatedMedia, SimulatedPeerFactory};
use ringcore::types::{CallEvent, CallEventHandler};

/// Remembers every cue it was asked to play.
#[derive(Debug, Default)]
pub struct RecordingCues {
    played: Mutex<Vec<Cue>>,
}

impl RecordingCues {
    pub fn played(&self) -> Vec<Cue> {
        self.played.lock().unwrap().clone()
    }
}

impl SoundCues for RecordingCues {
    fn play(&self, cue: Cue) {
        self.played.lock().unwrap().push(cue);
    }
}

/// Event handler that keeps every dispatched event.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingHandler {
    pub fn recorded(&self) -> Vec<CallEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl CallEventHandler for RecordingHandler {
    fn handle_event(&self, event: &CallEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// One user wired to shared in-memory infrastructure.
pub struct Party {
    pub client: CallClient,
    pub manager: Arc<CallManager>,
    pub cues: Arc<RecordingCues>,
    pub events: Arc<RecordingHandler>,
    pub peers: Arc<SimulatedPeerFactory>,
    pub media: Arc<SimulatedMedia>,
}

impl Party {
    pub fn new(
        user: &str,
        channel: &MemoryChannel,
        store: &MemoryCallStore,
        config: CallConfig,
    ) -> Self {
        let cues = Arc::new(RecordingCues::default());
        let events = Arc::new(RecordingHandler::default());
        let peers = Arc::new(SimulatedPeerFactory::new());
        let media = Arc::new(SimulatedMedia::new());

        let client = CallClient::builder()
            .with_user(user)
            .with_channel(Arc::new(channel.clone()))
            .with_store(Arc::new(store.clone()))
            .with_peer_factory(peers.clone())
            .with_media(media.clone())
            .with_cues(cues.clone())
            .with_config(config)
            .on_event(events.clone())
            .build()
            .expect("test client should build");
        let manager = client.manager().clone();

        Self {
            client,
            manager,
            cues,
            events,
            peers,
            media,
        }
    }

    pub async fn start(&self) {
        self.client.init().await.expect("test client should start");
    }
}

/// Poll `check` until it yields a value, giving up after a few seconds.
pub async fn wait_until<T, F, Fut>(mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .ok()
}
