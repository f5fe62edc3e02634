//! Access-log line parser and session CSV row format.
//!
//! One log line per HTTP request:
//!
//! ```text
//! <key> - - [05/Nov/2018:08:05:22 +0100] "GET /some/path HTTP/1.1" 200 1234
//! ```
//!
//! Lines that do not match the grammar, or whose timestamp does not parse
//! under the strict `dd/Mon/yyyy:HH:mm:ss ±HHMM` format, yield a typed
//! error — never a panic. The caller logs and skips them.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use thiserror::Error;

use crate::config::CsvStyle;

/// Strict timestamp format of the access log, e.g. `05/Nov/2018:08:05:22 +0100`.
const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Header of the quoted (extended) session CSV variant.
pub const CSV_HEADER_QUOTED: &str = "\"delay\",\"method\",\"request\",\"contenttype\",\"body\"";

/// Header of the bare (minimal) session CSV variant.
pub const CSV_HEADER_BARE: &str = "delay,method,request";

const DEFAULT_CONTENT_TYPE: &str = "*/*";

fn access_log_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(.*) - - \[([^\]]+)\] "([A-Z]+) ([^"]+) .+" .*"#)
            .expect("access log pattern is valid")
    })
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One parsed request from the access log.
///
/// `delay_ms` is always computed retrospectively — the gap to the next entry
/// of the same session key, or a terminal constant for the last entry. It is
/// never known at parse time and starts at 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub session_key: String,
    pub timestamp: DateTime<FixedOffset>,
    pub method: String,
    pub path: String,
    pub delay_ms: i64,
    pub content_type: String,
    pub body: String,
}

impl LogEntry {
    pub fn new(
        session_key: impl Into<String>,
        timestamp: DateTime<FixedOffset>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            timestamp,
            method: method.into(),
            path: path.into(),
            delay_ms: 0,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            body: String::new(),
        }
    }

    /// The `"METHOD path"` literal matched against the ignore list.
    pub fn endpoint_literal(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Project onto the CSV row shape (keys and timestamps do not survive
    /// into session files).
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            delay_ms: self.delay_ms,
            method: self.method.clone(),
            path: self.path.clone(),
            content_type: self.content_type.clone(),
            body: self.body.clone(),
        }
    }
}

/// One row of a session CSV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub delay_ms: i64,
    pub method: String,
    pub path: String,
    pub content_type: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum LineParseError {
    #[error("line does not match the access log grammar")]
    GrammarMismatch,
    #[error("invalid timestamp {0:?}")]
    BadTimestamp(String),
}

// ---------------------------------------------------------------------------
// Log line parsing
// ---------------------------------------------------------------------------

/// Parse one access log line into a [`LogEntry`].
pub fn parse_log_line(line: &str) -> Result<LogEntry, LineParseError> {
    let caps = access_log_pattern()
        .captures(line)
        .ok_or(LineParseError::GrammarMismatch)?;

    let raw_ts = &caps[2];
    let timestamp = DateTime::parse_from_str(raw_ts, TIMESTAMP_FORMAT)
        .map_err(|_| LineParseError::BadTimestamp(raw_ts.to_string()))?;

    Ok(LogEntry::new(&caps[1], timestamp, &caps[3], &caps[4]))
}

// ---------------------------------------------------------------------------
// CSV serialization
// ---------------------------------------------------------------------------

/// Header row for the given style.
pub fn csv_header(style: CsvStyle) -> &'static str {
    match style {
        CsvStyle::Quoted => CSV_HEADER_QUOTED,
        CsvStyle::Bare => CSV_HEADER_BARE,
    }
}

fn escape(field: &str) -> String {
    field.replace('"', "\"\"")
}

impl SessionRecord {
    pub fn to_csv_row(&self, style: CsvStyle) -> String {
        match style {
            CsvStyle::Quoted => format!(
                "\"{}\",\"{}\",\"{}\",\"{}\",\"{}\"",
                self.delay_ms,
                escape(&self.method),
                escape(&self.path),
                escape(&self.content_type),
                escape(&self.body),
            ),
            CsvStyle::Bare => format!("{},{},{}", self.delay_ms, self.method, self.path),
        }
    }

    /// Parse a row of either variant; quoted rows are recognized by their
    /// leading `"`.
    pub fn from_csv_line(line: &str) -> anyhow::Result<Self> {
        let fields = if line.starts_with('"') {
            split_quoted_fields(line)?
        } else {
            line.split(',').map(str::to_string).collect()
        };

        if fields.len() != 3 && fields.len() != 5 {
            anyhow::bail!("expected 3 or 5 CSV columns, got {}", fields.len());
        }

        let delay_ms: i64 = fields[0]
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid delay {:?}", fields[0]))?;

        Ok(Self {
            delay_ms,
            method: fields[1].clone(),
            path: fields[2].clone(),
            content_type: fields
                .get(3)
                .cloned()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            body: fields.get(4).cloned().unwrap_or_default(),
        })
    }
}

/// Split a fully quoted CSV row into unescaped fields. Embedded quotes are
/// doubled in the file.
fn split_quoted_fields(line: &str) -> anyhow::Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        match chars.next() {
            Some('"') => {}
            other => anyhow::bail!("expected opening quote, found {:?}", other),
        }

        let mut field = String::new();
        loop {
            match chars.next() {
                Some('"') => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        break;
                    }
                }
                Some(c) => field.push(c),
                None => anyhow::bail!("unterminated quoted field"),
            }
        }
        fields.push(field);

        match chars.next() {
            Some(',') => {}
            None => return Ok(fields),
            Some(c) => anyhow::bail!("unexpected character {:?} after field", c),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
