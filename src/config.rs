//! Run configuration for the split and combine subcommands.
//!
//! The business constants diverged between the two historical deployments of
//! this tool (capped vs uncapped request delays, 30 s vs 5 min inter-session
//! waits, quoted vs bare CSV rows). They are kept as named options with
//! defaults instead of hard-coded picks.

use std::fmt;

/// Inter-arrival gap above which a session is closed and a new one starts.
pub const SESSION_GAP_MS: i64 = 30 * 60 * 1000;

/// Default delay written for the final entry of a session during splitting.
pub const DEFAULT_TERMINAL_DELAY_MS: i64 = 30 * 1000;

/// Default minimum cumulative delay of a combined session.
pub const DEFAULT_MIN_SESSION_MS: i64 = 30 * 60 * 1000;

/// Default delay overwritten onto the last entry of each appended session.
pub const DEFAULT_INTER_SESSION_WAIT_MS: i64 = 5 * 60 * 1000;

/// CSV row variant used for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvStyle {
    /// Five double-quoted columns: delay, method, request, contenttype, body.
    Quoted,
    /// Three unquoted columns: delay, method, request.
    Bare,
}

impl fmt::Display for CsvStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsvStyle::Quoted => write!(f, "quoted"),
            CsvStyle::Bare => write!(f, "bare"),
        }
    }
}

/// Configuration for the split subcommand.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Gap threshold between two same-key entries before a new session file
    /// is started.
    pub gap_threshold_ms: i64,
    /// Optional ceiling applied to each in-session delay. `None` keeps the
    /// raw inter-arrival gap.
    pub delay_cap_ms: Option<i64>,
    /// Delay written for the last entry when the input ends.
    pub terminal_delay_ms: i64,
    pub csv_style: CsvStyle,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            gap_threshold_ms: SESSION_GAP_MS,
            delay_cap_ms: None,
            terminal_delay_ms: DEFAULT_TERMINAL_DELAY_MS,
            csv_style: CsvStyle::Quoted,
        }
    }
}

/// Configuration for the combine subcommand.
#[derive(Debug, Clone)]
pub struct CombineConfig {
    pub num_sessions: u32,
    pub num_iterations: u32,
    /// Stop appending once the sum of delays reaches this threshold.
    pub min_session_ms: i64,
    /// Delay overwritten onto the final entry of every appended session.
    pub inter_session_wait_ms: i64,
    pub csv_style: CsvStyle,
    /// Rayon pool size; 0 means one thread per CPU.
    pub workers: usize,
}

impl CombineConfig {
    pub fn new(num_sessions: u32, num_iterations: u32) -> Self {
        Self {
            num_sessions,
            num_iterations,
            min_session_ms: DEFAULT_MIN_SESSION_MS,
            inter_session_wait_ms: DEFAULT_INTER_SESSION_WAIT_MS,
            csv_style: CsvStyle::Quoted,
            workers: 0,
        }
    }
}
