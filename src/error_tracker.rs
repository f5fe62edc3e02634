//! Rate-limited logging of unparsable log lines.
//!
//! A garbage input file can contain millions of non-matching lines; logging
//! every one would drown the diagnostics that matter. The first failure and
//! every 100th after that are logged, and the total is reported at the end
//! of the run.

/// Log suppression interval for repeated parse failures.
const LOG_EVERY: u64 = 100;

#[derive(Debug, Default)]
pub struct ParseErrorTracker {
    total: u64,
}

impl ParseErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one unparsable line. Returns true if this failure should be
    /// logged (the 1st, 101st, 201st, ...).
    pub fn record(&mut self) -> bool {
        self.total += 1;
        self.total == 1 || self.total % LOG_EVERY == 1
    }

    /// Total number of unparsable lines seen.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_logs() {
        let mut tracker = ParseErrorTracker::new();
        assert!(tracker.record());
    }

    #[test]
    fn test_intermediate_errors_suppressed() {
        let mut tracker = ParseErrorTracker::new();
        assert!(tracker.record(), "1st should log");
        for i in 2..=100 {
            assert!(!tracker.record(), "error {} should be suppressed", i);
        }
        assert!(tracker.record(), "101st should log");
        assert_eq!(tracker.total(), 101);
    }
}
