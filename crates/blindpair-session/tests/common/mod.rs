use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use blindpair_core::config::SessionConfig;
use blindpair_core::directory::{ProfileDirectory, StaticDirectory};
use blindpair_core::memory_store::MemoryStore;
use blindpair_core::message::ChatMessage;
use blindpair_core::profile::Profile;
use blindpair_core::records::{self, MatchRecord, match_key};
use blindpair_core::room::RoomId;
use blindpair_core::state::SessionState;
use blindpair_core::store::Store;
use blindpair_core::test_helpers::{make_profile, seed_queue_entry};
use blindpair_core::time::now_millis;

use blindpair_session::channel::MessageChannel;
use blindpair_session::{SessionController, SessionDeps, SessionEvent, SessionHandle, SessionSnapshot};

/// Shared store and directory that a group of controllers run against.
pub struct TestWorld {
    pub store: Arc<MemoryStore>,
    pub directory: Arc<StaticDirectory>,
    pub config: SessionConfig,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::build(MemoryStore::new(), SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::build(MemoryStore::new(), config)
    }

    /// Every store operation takes `latency` of (virtual) time.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(MemoryStore::with_latency(latency), SessionConfig::default())
    }

    fn build(store: MemoryStore, config: SessionConfig) -> Self {
        Self {
            store: Arc::new(store),
            directory: Arc::new(StaticDirectory::new()),
            config,
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            store: Arc::clone(&self.store) as Arc<dyn Store>,
            directory: Arc::clone(&self.directory) as Arc<dyn ProfileDirectory>,
        }
    }

    /// Register a verified user and start a controller for them.
    pub fn spawn_user(&self, uid: &str) -> SessionHandle {
        self.directory.insert(make_profile(uid));
        SessionController::spawn(uid, self.deps(), self.config.clone()).expect("valid config")
    }

    /// Start a controller for a user with the given (possibly unverified)
    /// profile, or none at all.
    pub fn spawn_with_profile(&self, uid: &str, profile: Option<Profile>) -> SessionHandle {
        if let Some(profile) = profile {
            self.directory.insert(profile);
        }
        SessionController::spawn(uid, self.deps(), self.config.clone()).expect("valid config")
    }

    /// Put a passive user in the queue. Nothing reacts on their behalf.
    pub fn seed_waiting(&self, uid: &str) {
        seed_queue_entry(&self.store, uid, now_millis());
    }

    pub fn record(&self, uid: &str) -> Option<MatchRecord> {
        let key = match_key(uid);
        self.store
            .peek(&key)
            .map(|v| records::decode(&key, v).unwrap())
    }

    pub fn in_queue(&self, uid: &str) -> bool {
        self.store.peek(&records::queue_key(uid)).is_some()
    }

    pub async fn messages(&self, room: &RoomId) -> Vec<ChatMessage> {
        let channel = MessageChannel::new(Arc::clone(&self.store) as Arc<dyn Store>, &self.config);
        channel.fetch(room).await.unwrap()
    }

    /// Wait until `uid` has a queue entry.
    pub async fn wait_queued(&self, uid: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.in_queue(uid) {
            assert!(Instant::now() < deadline, "{uid} never joined the queue");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Wait (in virtual time) for the controller to reach `state`.
pub async fn wait_for_state(handle: &SessionHandle, state: SessionState, secs: u64) -> SessionSnapshot {
    let mut rx = handle.watch();
    let result = tokio::time::timeout(Duration::from_secs(secs), rx.wait_for(|s| s.state == state)).await;
    match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => panic!("{} controller stopped", handle.uid()),
        Err(_) => panic!(
            "{} did not reach {state:?} within {secs}s, last: {:?}",
            handle.uid(),
            handle.snapshot().state
        ),
    }
}

/// Next event matching `pred`, skipping others.
pub async fn expect_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    secs: u64,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let fut = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(_)) => {},
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .expect("expected event did not arrive")
}

/// Everything already buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Pair `a` (searching first) with `b`; returns both matched snapshots.
pub async fn pair(
    world: &TestWorld,
    a: &SessionHandle,
    b: &SessionHandle,
) -> (SessionSnapshot, SessionSnapshot) {
    a.start_matching().await.unwrap();
    world.wait_queued(a.uid()).await;
    b.start_matching().await.unwrap();
    let sa = wait_for_state(a, SessionState::Matched, 5).await;
    let sb = wait_for_state(b, SessionState::Matched, 5).await;
    (sa, sb)
}

/// Match `handle` with a passive queued partner that never acts.
pub async fn pair_with_passive(world: &TestWorld, handle: &SessionHandle, partner: &str) -> SessionSnapshot {
    world.seed_waiting(partner);
    handle.start_matching().await.unwrap();
    wait_for_state(handle, SessionState::Matched, 5).await
}

pub fn unique_uid(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
