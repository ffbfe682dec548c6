use serde::{Deserialize, Serialize};

/// Lifecycle of one client's session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Searching,
    Matched,
}

impl SessionState {
    /// A search or session is in progress.
    pub fn is_active(self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    /// Whether `self -> next` is a legal lifecycle edge.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Searching)
                | (SessionState::Searching, SessionState::Matched)
                | (SessionState::Searching, SessionState::Idle)
                | (SessionState::Matched, SessionState::Idle)
                | (SessionState::Matched, SessionState::Searching)
        )
    }
}

/// User-facing condition reported alongside a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Notice {
    VerificationRequired,
    ProfileUnavailable,
    SearchTimeout,
    /// A match write failed; the pairing may be one-sided.
    PartialWriteFailure,
    PartnerSkipped,
    PartnerLeft,
    /// Partner's record does not point back at us.
    GhostMatch,
    TimeUp,
    ConnectionUnstable,
    SendFailed,
}

impl Notice {
    pub fn text(self) -> &'static str {
        match self {
            Notice::VerificationRequired => "Verify your account to start matching.",
            Notice::ProfileUnavailable => "Your profile could not be loaded.",
            Notice::SearchTimeout => "No one is available right now. Try again soon.",
            Notice::PartialWriteFailure => "Could not fully set up the chat.",
            Notice::PartnerSkipped => "Your partner skipped. Finding someone new...",
            Notice::PartnerLeft => "Your partner left the chat.",
            Notice::GhostMatch => "That match fell through. Finding someone new...",
            Notice::TimeUp => "Time's up!",
            Notice::ConnectionUnstable => "Connection is unstable.",
            Notice::SendFailed => "Message could not be sent.",
        }
    }

    /// The user can simply try again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Notice::SearchTimeout
                | Notice::PartialWriteFailure
                | Notice::ConnectionUnstable
                | Notice::SendFailed
        )
    }
}

/// Health of the live channel as shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Searching,
    Connected,
    Reconnecting,
}
