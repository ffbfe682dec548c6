use crate::profile::Uid;

/// Failures reported by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable for {key}")]
    Unavailable { key: String },

    #[error("subscription to {key} lost")]
    SubscriptionLost { key: String },

    #[error("malformed record at {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl StoreError {
    pub fn malformed<K: Into<String>, R: ToString>(key: K, reason: R) -> Self {
        Self::Malformed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Matchmaking and session failures. An already running search or session
/// is not a failure; the controller answers it with a start outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("verification required before matching")]
    VerificationRequired,

    #[error("no partner found before the search timed out")]
    SearchTimeout,

    #[error("match write to {key} failed: {source}")]
    PartialWriteFailure { key: String, source: StoreError },

    #[error("live subscription failed: {0}")]
    Subscription(StoreError),

    #[error("partner {partner} is not reciprocally matched")]
    GhostMatch { partner: Uid },

    #[error("not in a matched session")]
    NotMatched,

    #[error("message is empty")]
    EmptyMessage,

    #[error("no profile found for {0}")]
    ProfileUnavailable(Uid),

    #[error("session controller has shut down")]
    ControllerClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn must_be_positive(field: &'static str) -> Self {
        Self::Invalid {
            field,
            reason: "must be > 0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_failure_names_key() {
        let err = MatchError::PartialWriteFailure {
            key: "matches/bob".into(),
            source: StoreError::Unavailable {
                key: "matches/bob".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "match write to matches/bob failed: store unavailable for matches/bob"
        );
    }

    #[test]
    fn ghost_match_names_partner() {
        let err = MatchError::GhostMatch {
            partner: "dan".into(),
        };
        assert_eq!(err.to_string(), "partner dan is not reciprocally matched");
    }

    #[test]
    fn subscription_wraps_lost_watch() {
        let err = MatchError::Subscription(StoreError::SubscriptionLost {
            key: "chats/room_1_abcd/messages".into(),
        });
        assert_eq!(
            err.to_string(),
            "live subscription failed: subscription to chats/room_1_abcd/messages lost"
        );
    }

    #[test]
    fn store_error_converts() {
        let err: MatchError = StoreError::malformed("queue/x", "missing uid").into();
        assert!(matches!(err, MatchError::Store(StoreError::Malformed { .. })));
    }
}
