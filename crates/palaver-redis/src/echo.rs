// Local-echo set: message ids this process published recently, so the
// pub/sub receiver can drop its own fan-out echo. Receipt probes the set
// without consuming, because one publish to many channels echoes the same id
// once per channel; the age-based sweep bounds entry lifetime instead.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Entries older than this are swept; also the longest window during which a
/// remote duplicate of a local id would be misclassified as an echo.
pub const ECHO_MAX_AGE_SECS: u64 = 300;

#[derive(Debug, Default)]
pub struct EchoSet {
    seen: Mutex<HashMap<String, u64>>,
}

impl EchoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally published message id.
    pub fn record(&self, message_id: &str, now: u64) {
        self.seen
            .lock()
            .expect("echo lock")
            .insert(message_id.to_string(), now);
    }

    /// Probe without removing.
    pub fn contains(&self, message_id: &str) -> bool {
        self.seen
            .lock()
            .expect("echo lock")
            .contains_key(message_id)
    }

    /// Drop entries older than [`ECHO_MAX_AGE_SECS`]; returns how many went.
    pub fn sweep(&self, now: u64) -> usize {
        let mut seen = self.seen.lock().expect("echo lock");
        let before = seen.len();
        seen.retain(|_, first_seen| now.saturating_sub(*first_seen) <= ECHO_MAX_AGE_SECS);
        before - seen.len()
    }
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probing_does_not_consume() {
        let echo = EchoSet::new();
        echo.record("m1", 100);
        assert!(echo.contains("m1"));
        assert!(echo.contains("m1"));
    }

    #[test]
    fn sweep_drops_only_aged_entries() {
        let echo = EchoSet::new();
        echo.record("old", 100);
        echo.record("fresh", 390);
        let swept = echo.sweep(401);
        assert_eq!(swept, 1);
        assert!(!echo.contains("old"));
        assert!(echo.contains("fresh"));
    }

    #[test]
    fn entry_at_the_age_boundary_survives() {
        let echo = EchoSet::new();
        echo.record("edge", 100);
        assert_eq!(echo.sweep(100 + ECHO_MAX_AGE_SECS), 0);
        assert!(echo.contains("edge"));
    }
}
