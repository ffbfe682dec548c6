//! Per-client session actor.
//!
//! One tokio task owns all mutable session state and is driven by two
//! mailboxes: commands from [`SessionHandle`]s and internal events from the
//! tasks it spawns (search, countdown, message feed, partner watch, grace
//! timers). Every internal event carries the [`Generation`] it was spawned
//! for and is dropped once that generation is gone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use blindpair_core::config::SessionConfig;
use blindpair_core::directory::ProfileDirectory;
use blindpair_core::error::{ConfigError, MatchError, StoreError};
use blindpair_core::message::{
    ChatMessage, END_NOTICE_TEXT, SKIP_NOTICE_TEXT, TIME_UP_NOTICE_TEXT, last_message,
};
use blindpair_core::profile::{PublicProfile, Uid};
use blindpair_core::records::{MatchRecord, messages_key};
use blindpair_core::room::RoomId;
use blindpair_core::state::{ConnectionStatus, Notice, SessionState};
use blindpair_core::store::Store;
use blindpair_core::time::format_time_left;

use crate::bridge::{NotificationBridge, Vanished};
use crate::channel::MessageChannel;
use crate::matchmaker::{Matchmaker, Pairing};
use crate::scope::{Generation, SessionScope};
use crate::timer::Countdown;

const EVENT_CAPACITY: usize = 256;

/// Collaborators a controller talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn Store>,
    pub directory: Arc<dyn ProfileDirectory>,
}

/// Everything a UI needs to render one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub generation: Generation,
    pub partner: Option<PublicProfile>,
    pub room_id: Option<RoomId>,
    pub messages: Vec<ChatMessage>,
    pub time_left_secs: u64,
    /// Time is running low, so the UI should offer an extension.
    pub can_extend: bool,
    pub notice: Option<Notice>,
    pub connection: ConnectionStatus,
}

impl SessionSnapshot {
    pub fn time_left_display(&self) -> String {
        format_time_left(self.time_left_secs)
    }
}

/// Change notifications published by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Notice(Notice),
    MessagesUpdated(usize),
}

/// Result of a `start_matching` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Already searching or matched; nothing changed.
    AlreadyActive,
}

enum Command {
    StartMatching {
        reply: oneshot::Sender<Result<StartOutcome, MatchError>>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    End {
        reply: oneshot::Sender<Result<(), MatchError>>,
    },
    Skip {
        reply: oneshot::Sender<Result<(), MatchError>>,
    },
    Extend {
        reply: oneshot::Sender<Result<u64, MatchError>>,
    },
    Send {
        text: String,
        reaction: bool,
        reply: oneshot::Sender<Result<String, MatchError>>,
    },
    DismissNotice,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum Internal {
    /// Begin (or re-begin after a debounce) the search for this generation.
    Search { generation: Generation },
    Paired {
        generation: Generation,
        pairing: Pairing,
    },
    SearchFailed {
        generation: Generation,
        error: MatchError,
    },
    Tick { generation: Generation },
    Messages {
        generation: Generation,
        messages: Vec<ChatMessage>,
    },
    Connection {
        generation: Generation,
        status: ConnectionStatus,
        unstable: bool,
    },
    Vanished {
        generation: Generation,
        kind: Vanished,
    },
    GraceElapsed {
        generation: Generation,
        resume: Resume,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Search,
    Idle,
}

/// State that exists only while matched.
struct ActiveSession {
    record: MatchRecord,
    countdown: Countdown,
    /// When the countdown reaches zero; moved by `extend`.
    deadline: Instant,
    /// A terminal transition has started; later triggers are ignored.
    closing: bool,
}

/// The per-client state machine. Use [`SessionController::spawn`] and talk
/// to it through the returned [`SessionHandle`].
pub struct SessionController {
    uid: Uid,
    config: SessionConfig,
    directory: Arc<dyn ProfileDirectory>,
    matchmaker: Matchmaker,
    channel: MessageChannel,
    bridge: NotificationBridge,

    state: SessionState,
    scope: Option<SessionScope>,
    last_generation: Generation,
    profile: Option<PublicProfile>,
    session: Option<ActiveSession>,
    messages: Vec<ChatMessage>,
    notice: Option<Notice>,
    connection: ConnectionStatus,

    internal_tx: mpsc::UnboundedSender<Internal>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Start the actor for `uid` and return a handle to it. Fails if
    /// `config` does not validate.
    pub fn spawn(
        uid: impl Into<Uid>,
        deps: SessionDeps,
        config: SessionConfig,
    ) -> Result<SessionHandle, ConfigError> {
        config.validate()?;
        let uid = uid.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let controller = SessionController {
            uid: uid.clone(),
            matchmaker: Matchmaker::new(Arc::clone(&deps.store)),
            channel: MessageChannel::new(Arc::clone(&deps.store), &config),
            bridge: NotificationBridge::new(Arc::clone(&deps.store)),
            directory: deps.directory,
            config,
            state: SessionState::Idle,
            scope: None,
            last_generation: 0,
            profile: None,
            session: None,
            messages: Vec::new(),
            notice: None,
            connection: ConnectionStatus::Disconnected,
            internal_tx,
            snapshot_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(controller.run(cmd_rx, internal_rx));

        Ok(SessionHandle {
            uid,
            cmd_tx,
            snapshot_rx,
            events_tx,
        })
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        tracing::debug!(uid = %self.uid, "Session controller started");
        loop {
            tokio::select! {
                // a due tick must win over a command arriving in the same instant
                biased;
                Some(event) = internal_rx.recv() => self.handle_internal(event).await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    },
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.teardown().await;
                        break;
                    },
                },
            }
        }
        tracing::debug!(uid = %self.uid, "Session controller stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartMatching { reply } => {
                let result = self.start_matching().await;
                let _ = reply.send(result);
            },
            Command::Cancel { reply } => {
                self.cancel().await;
                let _ = reply.send(());
            },
            Command::End { reply } => {
                let result = self.end().await;
                let _ = reply.send(result);
            },
            Command::Skip { reply } => {
                let result = self.skip().await;
                let _ = reply.send(result);
            },
            Command::Extend { reply } => {
                let _ = reply.send(self.extend());
            },
            Command::Send {
                text,
                reaction,
                reply,
            } => {
                let result = self.send(&text, reaction).await;
                let _ = reply.send(result);
            },
            Command::DismissNotice => {
                self.notice = None;
                self.publish();
            },
            // handled in run()
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            },
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        let generation = match &event {
            Internal::Search { generation }
            | Internal::Paired { generation, .. }
            | Internal::SearchFailed { generation, .. }
            | Internal::Tick { generation }
            | Internal::Messages { generation, .. }
            | Internal::Connection { generation, .. }
            | Internal::Vanished { generation, .. }
            | Internal::GraceElapsed { generation, .. } => *generation,
        };
        if !self.is_current(generation) {
            tracing::debug!(uid = %self.uid, generation, "Dropping stale session event");
            return;
        }

        match event {
            Internal::Search { .. } => self.run_search().await,
            Internal::Paired { pairing, .. } => self.enter_matched(pairing),
            Internal::SearchFailed { error, .. } => self.search_failed(error).await,
            Internal::Tick { .. } => self.tick().await,
            Internal::Messages { messages, .. } => {
                if self.is_open() {
                    self.messages = messages;
                    self.emit(SessionEvent::MessagesUpdated(self.messages.len()));
                    self.publish();
                }
            },
            Internal::Connection {
                status, unstable, ..
            } => {
                if self.is_open() {
                    self.connection = status;
                    if unstable {
                        self.set_notice(Notice::ConnectionUnstable);
                    }
                    self.publish();
                }
            },
            Internal::Vanished { kind, .. } => self.partner_vanished(kind).await,
            Internal::GraceElapsed { resume, .. } => match resume {
                Resume::Search => self.resume_search(Duration::ZERO),
                Resume::Idle => self.finish_to_idle(),
            },
        }
    }

    // ---- commands ----------------------------------------------------------

    async fn start_matching(&mut self) -> Result<StartOutcome, MatchError> {
        if self.state.is_active() {
            return Ok(StartOutcome::AlreadyActive);
        }
        let profile = match self.eligible_profile().await {
            Ok(profile) => profile,
            Err(e) => {
                self.publish();
                return Err(e);
            },
        };
        self.profile = Some(profile);
        self.notice = None;
        self.resume_search(Duration::ZERO);
        Ok(StartOutcome::Started)
    }

    async fn cancel(&mut self) {
        if self.state != SessionState::Searching {
            return;
        }
        self.scope = None;
        self.leave_queue().await;
        if let Err(e) = self.matchmaker.clear_record(&self.uid).await {
            tracing::warn!(uid = %self.uid, error = %e, "Failed to clear match record on cancel");
        }
        self.set_state(SessionState::Idle);
        self.connection = ConnectionStatus::Disconnected;
        self.publish();
    }

    async fn end(&mut self) -> Result<(), MatchError> {
        let closing = self.session.as_ref().ok_or(MatchError::NotMatched)?.closing;
        if closing {
            // partner already gone, skip the grace period
            self.finish_to_idle();
            return Ok(());
        }
        if self.deadline_passed() {
            self.expire().await;
            return Ok(());
        }
        self.close_session(Some((END_NOTICE_TEXT, false))).await;
        self.finish_to_idle();
        Ok(())
    }

    async fn skip(&mut self) -> Result<(), MatchError> {
        let closing = self.session.as_ref().ok_or(MatchError::NotMatched)?.closing;
        if !closing && self.deadline_passed() {
            self.expire().await;
            return Ok(());
        }
        if !closing {
            self.close_session(Some((SKIP_NOTICE_TEXT, true))).await;
        }
        self.resume_search(self.config.skip_debounce());
        Ok(())
    }

    fn extend(&mut self) -> Result<u64, MatchError> {
        let session = self.session.as_mut().ok_or(MatchError::NotMatched)?;
        if session.closing {
            return Err(MatchError::NotMatched);
        }
        let remaining = session.countdown.extend();
        session.deadline += Duration::from_secs(self.config.extend_secs);
        tracing::debug!(uid = %self.uid, remaining, "Extended session");
        self.publish();
        Ok(remaining)
    }

    async fn send(&mut self, text: &str, reaction: bool) -> Result<String, MatchError> {
        let room_id = match &self.session {
            Some(session) if !session.closing => session.record.room_id.clone(),
            _ => return Err(MatchError::NotMatched),
        };
        let result = if reaction {
            self.channel.send_reaction(&room_id, &self.uid, text).await
        } else {
            self.channel.send_text(&room_id, &self.uid, text).await
        };
        if let Err(MatchError::Store(e)) = &result {
            tracing::warn!(uid = %self.uid, room = %room_id, error = %e, "Message send failed");
            self.set_notice(Notice::SendFailed);
            self.publish();
        }
        result
    }

    // ---- searching ---------------------------------------------------------

    /// Enter Searching under a fresh generation and search after `delay`.
    fn resume_search(&mut self, delay: Duration) {
        self.session = None;
        self.messages.clear();
        let scope = self.new_scope();
        let generation = scope.generation();
        let tx = self.internal_tx.clone();
        scope.spawn_live(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(Internal::Search { generation });
        });
        self.scope = Some(scope);
        self.connection = ConnectionStatus::Searching;
        self.set_state(SessionState::Searching);
        self.publish();
    }

    /// Re-check eligibility, then run one search attempt in the background.
    async fn run_search(&mut self) {
        if self.state != SessionState::Searching {
            return;
        }
        let profile = match self.eligible_profile().await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::info!(uid = %self.uid, error = %e, "Search aborted");
                self.scope = None;
                self.set_state(SessionState::Idle);
                self.connection = ConnectionStatus::Disconnected;
                self.publish();
                return;
            },
        };
        self.profile = Some(profile.clone());

        let Some(scope) = &self.scope else {
            return;
        };
        let generation = scope.generation();
        let matchmaker = self.matchmaker.clone();
        let max_age_ms = self.config.queue_max_age_ms();
        let timeout = self.config.search_timeout();
        let tx = self.internal_tx.clone();
        tracing::info!(uid = %self.uid, generation, "Searching for a partner");
        scope.spawn_live(async move {
            let event = match matchmaker.start_match(&profile, max_age_ms, timeout).await {
                Ok(pairing) => Internal::Paired {
                    generation,
                    pairing,
                },
                Err(error) => Internal::SearchFailed { generation, error },
            };
            let _ = tx.send(event);
        });
    }

    async fn search_failed(&mut self, error: MatchError) {
        if self.state != SessionState::Searching {
            return;
        }
        let notice = match &error {
            MatchError::SearchTimeout => Notice::SearchTimeout,
            MatchError::PartialWriteFailure { .. } => Notice::PartialWriteFailure,
            _ => Notice::ConnectionUnstable,
        };
        tracing::info!(uid = %self.uid, error = %error, "Search ended without a match");
        self.scope = None;
        self.leave_queue().await;
        if let Err(e) = self.matchmaker.clear_record(&self.uid).await {
            tracing::warn!(uid = %self.uid, error = %e, "Failed to clear match record");
        }
        self.set_notice(notice);
        self.connection = ConnectionStatus::Disconnected;
        self.set_state(SessionState::Idle);
        self.publish();
    }

    // ---- matched -----------------------------------------------------------

    fn enter_matched(&mut self, pairing: Pairing) {
        if self.state != SessionState::Searching {
            return;
        }
        let (record, partial) = match pairing {
            Pairing::Created { record, partial } => (record, partial),
            Pairing::Found(record) => (record, None),
        };
        if let Some(e) = &partial {
            tracing::warn!(uid = %self.uid, room = %record.room_id, error = %e, "Matched with a partial write");
            self.set_notice(Notice::PartialWriteFailure);
        }

        let scope = self.new_scope();
        let generation = scope.generation();
        tracing::info!(
            uid = %self.uid,
            partner = %record.partner.uid,
            room = %record.room_id,
            generation,
            "Session started"
        );

        scope.spawn_live(run_countdown(generation, self.internal_tx.clone()));
        scope.spawn_live(run_message_feed(
            self.channel.clone(),
            record.room_id.clone(),
            generation,
            self.internal_tx.clone(),
            self.config.clone(),
        ));
        scope.spawn_live(run_partner_watch(
            self.bridge.clone(),
            self.uid.clone(),
            record.clone(),
            generation,
            self.internal_tx.clone(),
            self.config.clone(),
        ));

        self.scope = Some(scope);
        self.session = Some(ActiveSession {
            record,
            countdown: Countdown::new(&self.config),
            deadline: Instant::now() + Duration::from_secs(self.config.session_duration_secs),
            closing: false,
        });
        self.messages.clear();
        self.connection = ConnectionStatus::Connected;
        self.set_state(SessionState::Matched);
        self.publish();
    }

    async fn tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.closing {
            return;
        }
        if !session.countdown.tick() {
            self.publish();
            return;
        }
        self.expire().await;
    }

    /// The countdown's deadline has passed even if its final tick is still
    /// queued.
    fn deadline_passed(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| Instant::now() >= s.deadline)
    }

    async fn expire(&mut self) {
        if let Some(session) = &self.session {
            tracing::info!(uid = %self.uid, room = %session.record.room_id, "Session time is up");
        }
        self.close_session(Some((TIME_UP_NOTICE_TEXT, false))).await;
        self.set_notice(Notice::TimeUp);
        self.finish_to_idle();
    }

    async fn partner_vanished(&mut self, kind: Vanished) {
        let Some(session) = &self.session else {
            return;
        };
        if session.closing {
            return;
        }
        let room_id = session.record.room_id.clone();
        let partner = session.record.partner.uid.clone();
        self.close_session(None).await;

        let (notice, resume, grace) = match kind {
            Vanished::Ghost => {
                let error = MatchError::GhostMatch {
                    partner: partner.clone(),
                };
                tracing::warn!(uid = %self.uid, room = %room_id, error = %error, "Pairing lost to a concurrent match");
                (
                    Notice::GhostMatch,
                    Resume::Search,
                    self.config.partner_skipped_grace(),
                )
            },
            Vanished::Absent => {
                let messages = match self.channel.fetch(&room_id).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        tracing::warn!(room = %room_id, error = %e, "Using cached messages");
                        self.messages.clone()
                    },
                };
                if last_message(&messages).is_some_and(|m| m.is_system() && m.is_skip_action()) {
                    (
                        Notice::PartnerSkipped,
                        Resume::Search,
                        self.config.partner_skipped_grace(),
                    )
                } else {
                    (
                        Notice::PartnerLeft,
                        Resume::Idle,
                        self.config.partner_left_grace(),
                    )
                }
            },
        };
        tracing::info!(uid = %self.uid, partner = %partner, room = %room_id, ?kind, ?notice, "Partner vanished");
        self.set_notice(notice);
        self.publish();

        if let Some(scope) = &self.scope {
            let generation = scope.generation();
            let tx = self.internal_tx.clone();
            scope.spawn_root(async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(Internal::GraceElapsed { generation, resume });
            });
        }
    }

    /// Mark the session closing, stop its live tasks, optionally leave a
    /// system message for the partner, then release our match record.
    async fn close_session(&mut self, farewell: Option<(&str, bool)>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.closing = true;
        let room_id = session.record.room_id.clone();
        if let Some(scope) = &self.scope {
            scope.close_live();
        }
        self.connection = ConnectionStatus::Disconnected;

        if let Some((text, skip)) = farewell
            && let Err(e) = self.channel.send_system(&room_id, text, skip).await
        {
            tracing::warn!(uid = %self.uid, room = %room_id, error = %e, "Failed to send system message");
        }
        match self.matchmaker.release_record(&self.uid, &room_id).await {
            Ok(true) => {},
            Ok(false) => {
                tracing::debug!(uid = %self.uid, room = %room_id, "Match record belongs to a newer pairing, kept");
            },
            Err(e) => {
                tracing::warn!(uid = %self.uid, room = %room_id, error = %e, "Failed to release match record");
            },
        }
    }

    fn finish_to_idle(&mut self) {
        self.scope = None;
        self.session = None;
        self.messages.clear();
        self.connection = ConnectionStatus::Disconnected;
        self.set_state(SessionState::Idle);
        self.publish();
    }

    /// Leave whatever we are doing. Used on shutdown.
    async fn teardown(&mut self) {
        match self.state {
            SessionState::Searching => self.cancel().await,
            SessionState::Matched => {
                let closing = self.session.as_ref().is_some_and(|s| s.closing);
                if !closing {
                    self.close_session(None).await;
                }
                self.finish_to_idle();
            },
            SessionState::Idle => {},
        }
        self.scope = None;
    }

    // ---- helpers -----------------------------------------------------------

    async fn eligible_profile(&mut self) -> Result<PublicProfile, MatchError> {
        let profile = match self.directory.lookup(&self.uid).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                self.set_notice(Notice::ProfileUnavailable);
                return Err(MatchError::ProfileUnavailable(self.uid.clone()));
            },
            Err(e) => {
                self.set_notice(Notice::ProfileUnavailable);
                return Err(e.into());
            },
        };
        if let Err(e) = Matchmaker::check_eligible(&profile) {
            self.set_notice(Notice::VerificationRequired);
            return Err(e);
        }
        Ok(profile.public())
    }

    async fn leave_queue(&self) {
        if let Err(e) = self.matchmaker.queue().leave(&self.uid).await {
            tracing::warn!(uid = %self.uid, error = %e, "Failed to leave queue");
        }
    }

    fn new_scope(&mut self) -> SessionScope {
        self.last_generation += 1;
        SessionScope::new(self.last_generation)
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.scope
            .as_ref()
            .is_some_and(|scope| scope.is_current(generation))
    }

    fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.closing)
    }

    fn set_state(&mut self, next: SessionState) {
        let from = self.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            tracing::warn!(uid = %self.uid, ?from, to = ?next, "Invalid session state transition");
            return;
        }
        self.state = next;
        tracing::info!(uid = %self.uid, ?from, to = ?next, generation = self.last_generation, "Session state changed");
        self.emit(SessionEvent::StateChanged { from, to: next });
    }

    fn set_notice(&mut self, notice: Notice) {
        self.notice = Some(notice);
        self.emit(SessionEvent::Notice(notice));
    }

    fn emit(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.events_tx.send(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        SessionSnapshot {
            state: self.state,
            generation: self.scope.as_ref().map_or(0, SessionScope::generation),
            partner: session.map(|s| s.record.partner.clone()),
            room_id: session.map(|s| s.record.room_id.clone()),
            messages: self.messages.clone(),
            time_left_secs: session.map_or(0, |s| s.countdown.remaining()),
            can_extend: session.is_some_and(|s| !s.closing && s.countdown.is_low()),
            notice: self.notice,
            connection: self.connection,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

// ---- scoped tasks ------------------------------------------------------------

async fn run_countdown(generation: Generation, tx: mpsc::UnboundedSender<Internal>) {
    let period = Duration::from_secs(1);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if tx.send(Internal::Tick { generation }).is_err() {
            break;
        }
    }
}

/// Keeps the room's message set flowing, resubscribing after losses.
async fn run_message_feed(
    channel: MessageChannel,
    room_id: RoomId,
    generation: Generation,
    tx: mpsc::UnboundedSender<Internal>,
    config: SessionConfig,
) {
    let mut failures: u32 = 0;
    loop {
        let lost = match channel.subscribe(&room_id).await {
            Ok(mut feed) => {
                if failures > 0 {
                    failures = 0;
                    let _ = tx.send(Internal::Connection {
                        generation,
                        status: ConnectionStatus::Connected,
                        unstable: false,
                    });
                }
                loop {
                    match feed.next().await {
                        Some(Ok(messages)) => {
                            if tx.send(Internal::Messages { generation, messages }).is_err() {
                                return;
                            }
                        },
                        Some(Err(e)) => {
                            tracing::warn!(room = %room_id, error = %e, "Message feed lost");
                            break e;
                        },
                        None => {
                            break StoreError::SubscriptionLost {
                                key: messages_key(&room_id),
                            };
                        },
                    }
                }
            },
            Err(e) => {
                tracing::warn!(room = %room_id, error = %e, "Message subscribe failed");
                e
            },
        };
        failures += 1;
        if !report_reconnect(&tx, generation, failures, lost, &config) {
            return;
        }
        tokio::time::sleep(config.resubscribe_backoff()).await;
    }
}

/// Watches the pairing until the partner vanishes, resubscribing after
/// losses. Reports at most one vanish.
async fn run_partner_watch(
    bridge: NotificationBridge,
    uid: Uid,
    record: MatchRecord,
    generation: Generation,
    tx: mpsc::UnboundedSender<Internal>,
    config: SessionConfig,
) {
    let mut failures: u32 = 0;
    loop {
        let lost = match bridge.watch(&uid, &record).await {
            Ok(watch) => {
                if failures > 0 {
                    failures = 0;
                    let _ = tx.send(Internal::Connection {
                        generation,
                        status: ConnectionStatus::Connected,
                        unstable: false,
                    });
                }
                match watch.vanished().await {
                    Ok(kind) => {
                        let _ = tx.send(Internal::Vanished { generation, kind });
                        return;
                    },
                    Err(e) => {
                        tracing::warn!(uid = %uid, error = %e, "Partner watch lost");
                        e
                    },
                }
            },
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Partner watch subscribe failed");
                e
            },
        };
        failures += 1;
        if !report_reconnect(&tx, generation, failures, lost, &config) {
            return;
        }
        tokio::time::sleep(config.resubscribe_backoff()).await;
    }
}

/// Returns false once the controller is gone.
fn report_reconnect(
    tx: &mpsc::UnboundedSender<Internal>,
    generation: Generation,
    failures: u32,
    lost: StoreError,
    config: &SessionConfig,
) -> bool {
    let unstable = failures >= config.resubscribe_attempts;
    if unstable {
        let error = MatchError::Subscription(lost);
        tracing::warn!(generation, failures, error = %error, "Subscription keeps failing");
    }
    tx.send(Internal::Connection {
        generation,
        status: ConnectionStatus::Reconnecting,
        unstable,
    })
    .is_ok()
}

/// Cloneable front end of a [`SessionController`].
///
/// The controller shuts down when `shutdown` is called or every handle is
/// dropped.
#[derive(Clone)]
pub struct SessionHandle {
    uid: Uid,
    cmd_tx: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Begin searching. Rejected with `VerificationRequired` or
    /// `ProfileUnavailable`; a no-op if already searching or matched.
    pub async fn start_matching(&self) -> Result<StartOutcome, MatchError> {
        self.request(|reply| Command::StartMatching { reply }).await?
    }

    /// Abandon a search. Does nothing unless searching.
    pub async fn cancel(&self) -> Result<(), MatchError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Leave the session and return to idle.
    pub async fn end(&self) -> Result<(), MatchError> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Leave the session and search for a new partner.
    pub async fn skip(&self) -> Result<(), MatchError> {
        self.request(|reply| Command::Skip { reply }).await?
    }

    /// Extend the countdown; returns the new remaining seconds.
    pub async fn extend(&self) -> Result<u64, MatchError> {
        self.request(|reply| Command::Extend { reply }).await?
    }

    pub async fn send_message(&self, text: &str) -> Result<String, MatchError> {
        let text = text.to_string();
        self.request(|reply| Command::Send {
            text,
            reaction: false,
            reply,
        })
        .await?
    }

    /// Send a short reaction such as one of [`blindpair_core::message::REACTIONS`].
    pub async fn send_reaction(&self, payload: &str) -> Result<String, MatchError> {
        let text = payload.to_string();
        self.request(|reply| Command::Send {
            text,
            reaction: true,
            reply,
        })
        .await?
    }

    pub fn dismiss_notice(&self) -> Result<(), MatchError> {
        self.cmd_tx
            .send(Command::DismissNotice)
            .map_err(|_| MatchError::ControllerClosed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Leave the queue, release the match record and stop the controller.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| MatchError::ControllerClosed)?;
        reply_rx.await.map_err(|_| MatchError::ControllerClosed)
    }
}
