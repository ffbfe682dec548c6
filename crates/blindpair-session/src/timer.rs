use blindpair_core::config::SessionConfig;
use blindpair_core::time::format_time_left;

/// Per-session countdown, advanced once per second by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    remaining: u64,
    extend_by: u64,
    low_threshold: u64,
}

impl Countdown {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            remaining: config.session_duration_secs,
            extend_by: config.extend_secs,
            low_threshold: config.low_time_threshold_secs,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Count one second down. Returns true on the tick that reaches zero.
    pub fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.remaining == 0
    }

    /// Add the configured extension and return the new remaining time.
    /// Allowed at any time; the UI offers it only when time runs low.
    pub fn extend(&mut self) -> u64 {
        self.remaining = self.remaining.saturating_add(self.extend_by);
        self.remaining
    }

    pub fn is_low(&self) -> bool {
        self.remaining <= self.low_threshold
    }

    pub fn is_expired(&self) -> bool {
        self.remaining == 0
    }

    pub fn display(&self) -> String {
        format_time_left(self.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn countdown(secs: u64) -> Countdown {
        Countdown::new(&SessionConfig {
            session_duration_secs: secs,
            ..SessionConfig::default()
        })
    }

    #[test]
    fn extend_from_45_gives_345() {
        let mut cd = countdown(45);
        assert!(cd.is_low());
        assert_eq!(cd.extend(), 345);
        assert!(!cd.is_low());
    }

    #[test]
    fn extend_is_repeatable() {
        let mut cd = countdown(300);
        cd.extend();
        assert_eq!(cd.extend(), 900);
    }

    #[test]
    fn expires_exactly_once() {
        let mut cd = countdown(2);
        assert!(!cd.tick());
        assert!(cd.tick());
        assert!(cd.is_expired());
        assert!(!cd.tick());
        assert_eq!(cd.remaining(), 0);
    }

    #[test]
    fn low_threshold_boundary() {
        let cd = countdown(60);
        assert!(cd.is_low());
        assert!(!countdown(61).is_low());
    }

    #[test]
    fn display_format() {
        assert_eq!(countdown(300).display(), "5:00");
    }
}
