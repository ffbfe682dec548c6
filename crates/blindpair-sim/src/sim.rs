use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use blindpair_core::directory::{ProfileDirectory, StaticDirectory};
use blindpair_core::error::{ConfigError, MatchError};
use blindpair_core::memory_store::MemoryStore;
use blindpair_core::message::REACTIONS;
use blindpair_core::profile::Profile;
use blindpair_core::state::{ConnectionStatus, Notice, SessionState};
use blindpair_core::store::Store;

use blindpair_session::{SessionController, SessionDeps, SessionEvent, SessionHandle};

use crate::config::SimConfig;

const AFFILIATIONS: &[&str] = &["North Campus", "South Campus", "Riverside", "Old Quad"];

const LINES: &[&str] = &[
    "hey",
    "what are you studying?",
    "ha, same",
    "any good food spots near you?",
    "this is oddly fun",
    "ok that made me laugh",
];

/// What a simulated client does on its next turn while matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Chat,
    React,
    Extend,
    Skip,
    End,
    Wait,
}

fn pick_action() -> Action {
    match rand::rng().random_range(0..100) {
        0..50 => Action::Chat,
        50..65 => Action::React,
        65..70 => Action::Extend,
        70..85 => Action::Skip,
        85..95 => Action::End,
        _ => Action::Wait,
    }
}

fn think_time() -> Duration {
    Duration::from_millis(rand::rng().random_range(500..4000))
}

fn idle_pause() -> Duration {
    Duration::from_millis(rand::rng().random_range(200..2500))
}

/// Counters gathered from every client's event stream.
#[derive(Debug, Default)]
pub struct SimStats {
    matches: AtomicU64,
    ghosts: AtomicU64,
    timeouts: AtomicU64,
    partner_skipped: AtomicU64,
    partner_left: AtomicU64,
    time_ups: AtomicU64,
    messages_sent: AtomicU64,
}

impl SimStats {
    fn record(&self, event: &SessionEvent) {
        let counter = match event {
            SessionEvent::StateChanged {
                to: SessionState::Matched,
                ..
            } => &self.matches,
            SessionEvent::Notice(Notice::GhostMatch) => &self.ghosts,
            SessionEvent::Notice(Notice::SearchTimeout) => &self.timeouts,
            SessionEvent::Notice(Notice::PartnerSkipped) => &self.partner_skipped,
            SessionEvent::Notice(Notice::PartnerLeft) => &self.partner_left,
            SessionEvent::Notice(Notice::TimeUp) => &self.time_ups,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> SimReport {
        SimReport {
            matches: self.matches.load(Ordering::Relaxed),
            ghosts: self.ghosts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            partner_skipped: self.partner_skipped.load(Ordering::Relaxed),
            partner_left: self.partner_left.load(Ordering::Relaxed),
            time_ups: self.time_ups.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimReport {
    pub matches: u64,
    pub ghosts: u64,
    pub timeouts: u64,
    pub partner_skipped: u64,
    pub partner_left: u64,
    pub time_ups: u64,
    pub messages_sent: u64,
}

fn make_client(index: usize) -> Profile {
    let uid = format!("sim-{}", uuid::Uuid::new_v4().simple());
    let affiliation = AFFILIATIONS[index % AFFILIATIONS.len()];
    Profile::new(uid, format!("Client {index}"))
        .verified()
        .with_attribute("affiliation", affiliation)
}

/// Run `config.clients` controllers against one shared store for
/// `config.run_secs`, then shut every controller down.
pub async fn run(config: SimConfig) -> Result<SimReport, ConfigError> {
    let store = Arc::new(MemoryStore::with_latency(config.store_latency()));
    let profiles: Vec<Profile> = (0..config.clients).map(make_client).collect();
    let directory = Arc::new(StaticDirectory::with_profiles(profiles.iter().cloned()));
    let deps = SessionDeps {
        store: Arc::clone(&store) as Arc<dyn Store>,
        directory: directory as Arc<dyn ProfileDirectory>,
    };
    let stats = Arc::new(SimStats::default());

    let mut handles = Vec::with_capacity(profiles.len());
    let mut tasks = JoinSet::new();
    for profile in &profiles {
        let handle = SessionController::spawn(profile.uid.clone(), deps.clone(), config.session.clone())?;
        tasks.spawn(log_events(handle.clone(), Arc::clone(&stats)));
        tasks.spawn(drive_client(handle.clone(), Arc::clone(&stats)));
        handles.push(handle);
    }
    tracing::info!(clients = handles.len(), run_secs = config.run_secs, "Simulation running");

    tokio::time::sleep(config.run_for()).await;

    tasks.abort_all();
    for handle in &handles {
        handle.shutdown().await;
    }
    // let cancelled tasks drop their subscriptions
    tokio::time::sleep(Duration::from_millis(50)).await;
    let leftover: usize = ["queue", "matches", "chats"]
        .iter()
        .map(|prefix| store.watcher_count(prefix))
        .sum();
    if leftover > 0 {
        tracing::warn!(leftover, "Subscriptions still open after shutdown");
    }
    Ok(stats.report())
}

async fn log_events(handle: SessionHandle, stats: Arc<SimStats>) {
    let mut events = BroadcastStream::new(handle.events());
    while let Some(item) = events.next().await {
        match item {
            Ok(SessionEvent::MessagesUpdated(count)) => {
                tracing::debug!(uid = %handle.uid(), count, "Messages updated");
            },
            Ok(event) => {
                tracing::info!(uid = %handle.uid(), ?event, "Session event");
                stats.record(&event);
            },
            Err(e) => tracing::warn!(uid = %handle.uid(), error = %e, "Event stream lagged"),
        }
    }
}

/// Plays one user: search whenever idle, and while matched take a random
/// action every few seconds.
async fn drive_client(handle: SessionHandle, stats: Arc<SimStats>) {
    let mut rx = handle.watch();
    let mut next_action: Option<Instant> = None;
    let mut session_generation = 0;
    loop {
        let snap = rx.borrow_and_update().clone();
        match snap.state {
            SessionState::Idle => {
                next_action = None;
                tokio::time::sleep(idle_pause()).await;
                match handle.start_matching().await {
                    Ok(_) => {},
                    Err(MatchError::ControllerClosed) => return,
                    Err(e) => tracing::warn!(uid = %handle.uid(), error = %e, "Start rejected"),
                }
                continue;
            },
            SessionState::Matched if snap.connection == ConnectionStatus::Connected => {
                if session_generation != snap.generation || next_action.is_none() {
                    session_generation = snap.generation;
                    next_action = Some(Instant::now() + think_time());
                }
            },
            _ => next_action = None,
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            },
            () = wait_until(next_action) => {
                next_action = Some(Instant::now() + think_time());
                match act(&handle, pick_action(), &stats).await {
                    Ok(()) => {},
                    Err(MatchError::ControllerClosed) => return,
                    Err(e) => tracing::debug!(uid = %handle.uid(), error = %e, "Action refused"),
                }
            },
        }
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn act(handle: &SessionHandle, action: Action, stats: &SimStats) -> Result<(), MatchError> {
    tracing::debug!(uid = %handle.uid(), ?action, "Acting");
    match action {
        Action::Chat => {
            let line = LINES[rand::rng().random_range(0..LINES.len())];
            handle.send_message(line).await?;
            stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        },
        Action::React => {
            let reaction = REACTIONS[rand::rng().random_range(0..REACTIONS.len())];
            handle.send_reaction(reaction).await?;
            stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        },
        Action::Extend => {
            if handle.snapshot().can_extend {
                handle.extend().await?;
            }
        },
        Action::Skip => handle.skip().await?,
        Action::End => handle.end().await?,
        Action::Wait => {},
    }
    Ok(())
}
