//! Split driver: one pass over the access log file.
//!
//! Parses each line, drops ignored endpoints, and dispatches entries to the
//! collector worker owning their session key (insert-if-absent registry).
//! After input exhaustion every worker gets an end-of-stream message and is
//! joined explicitly, so no session is left unflushed.

pub mod collector;

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use memmap2::Mmap;

use crate::config::SplitConfig;
use crate::error_tracker::ParseErrorTracker;
use crate::pipeline::annotator::Annotator;
use crate::pipeline::parser;
use collector::{CollectorHandle, CollectorMsg};

/// Threshold for switching from buffered read to mmap (1 MB).
const MMAP_THRESHOLD: u64 = 1_048_576;

#[derive(Debug, Default)]
pub struct SplitSummary {
    pub lines_read: u64,
    pub lines_unparsable: u64,
    pub entries_ignored: u64,
    pub entries_dispatched: u64,
    pub entries_dropped: u64,
    pub entries_written: u64,
    pub session_keys: u64,
    pub sessions: u64,
    pub write_errors: u64,
}

pub struct Splitter {
    config: SplitConfig,
    annotator: Arc<Annotator>,
    ignored_endpoints: HashSet<String>,
}

impl Splitter {
    pub fn new(config: SplitConfig, annotator: Annotator) -> Self {
        Self {
            config,
            annotator: Arc::new(annotator),
            ignored_endpoints: HashSet::new(),
        }
    }

    /// Load the newline-delimited `METHOD path` ignore list. An unreadable
    /// file is a startup error.
    pub fn with_ignore_list(mut self, path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading ignore list {}", path.display()))?;
        self.ignored_endpoints = data
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect();
        tracing::info!(
            count = self.ignored_endpoints.len(),
            file = %path.display(),
            "loaded ignored endpoints"
        );
        Ok(self)
    }

    pub fn run(&self, log_path: &Path, out_dir: &Path) -> Result<SplitSummary> {
        tracing::info!(logs = %log_path.display(), "parsing access logs");
        tracing::info!(dir = %out_dir.display(), "writing sessions");

        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("creating output directory {}", out_dir.display()))?;

        let mut summary = SplitSummary::default();
        let mut workers: HashMap<String, CollectorHandle> = HashMap::new();
        let mut parse_errors = ParseErrorTracker::new();

        for_each_line(log_path, |raw| {
            self.dispatch_line(raw, out_dir, &mut workers, &mut summary, &mut parse_errors);
        })?;

        if parse_errors.total() > 0 {
            tracing::info!(total = parse_errors.total(), "unparsable lines skipped");
        }

        // Signal end of input to every worker, then join each one. A worker
        // only finishes after flushing its held entry, so a completed join
        // set means no session data is in flight.
        for handle in workers.values() {
            let _ = handle.tx.send(CollectorMsg::EndOfStream);
        }

        summary.session_keys = workers.len() as u64;
        for (key, handle) in workers {
            match handle.handle.join() {
                Ok(stats) => {
                    summary.entries_written += stats.entries_written;
                    summary.entries_dropped += stats.entries_dropped;
                    summary.sessions += stats.sessions;
                    summary.write_errors += stats.write_errors;
                }
                Err(_) => {
                    tracing::error!(key = %key, "collector worker panicked");
                    summary.write_errors += 1;
                }
            }
        }

        Ok(summary)
    }

    fn dispatch_line(
        &self,
        raw: &[u8],
        out_dir: &Path,
        workers: &mut HashMap<String, CollectorHandle>,
        summary: &mut SplitSummary,
        parse_errors: &mut ParseErrorTracker,
    ) {
        summary.lines_read += 1;

        // A non-UTF-8 line can never be a valid log line; counting it here
        // keeps replacement characters out of session keys and paths.
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(_) => {
                summary.lines_unparsable += 1;
                if parse_errors.record() {
                    tracing::warn!("log line is not valid UTF-8");
                }
                return;
            }
        };

        let entry = match parser::parse_log_line(line) {
            Ok(entry) => entry,
            Err(e) => {
                summary.lines_unparsable += 1;
                if parse_errors.record() {
                    tracing::warn!(error = %e, line, "cannot parse log line");
                }
                return;
            }
        };

        // Exact-literal match against the raw, pre-annotation request.
        if self.ignored_endpoints.contains(&entry.endpoint_literal()) {
            summary.entries_ignored += 1;
            return;
        }

        let handle = workers.entry(entry.session_key.clone()).or_insert_with_key(|key| {
            collector::spawn(
                key.clone(),
                out_dir.to_path_buf(),
                self.config.clone(),
                Arc::clone(&self.annotator),
            )
        });

        if handle.tx.send(CollectorMsg::Entry(entry)).is_err() {
            // Only possible if the worker died; the join below will report it.
            tracing::error!("collector channel closed early");
        } else {
            summary.entries_dispatched += 1;
        }
    }
}

/// Feed every raw line of the file to `f`, choosing the read strategy by
/// size: buffered reads for small files, mmap line-walking above
/// [`MMAP_THRESHOLD`]. Line terminators are stripped; UTF-8 validation is
/// the caller's concern.
fn for_each_line(path: &Path, mut f: impl FnMut(&[u8])) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();

    if size > MMAP_THRESHOLD {
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmapping {}", path.display()))?;
        for raw in mmap.split(|&b| b == b'\n') {
            let raw = strip_cr(raw);
            if raw.is_empty() {
                continue;
            }
            f(raw);
        }
    } else {
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("reading {}", path.display()))?;
            if n == 0 {
                break;
            }
            let mut raw = buf.as_slice();
            if raw.last() == Some(&b'\n') {
                raw = &raw[..raw.len() - 1];
            }
            let raw = strip_cr(raw);
            if raw.is_empty() {
                continue;
            }
            f(raw);
        }
    }

    Ok(())
}

fn strip_cr(raw: &[u8]) -> &[u8] {
    match raw.last() {
        Some(&b'\r') => &raw[..raw.len() - 1],
        _ => raw,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parser::SessionRecord;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_log(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = dir.join("access.log");
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    fn log_line(key: &str, time: &str, method: &str, path: &str) -> String {
        format!(
            "{} - - [05/Nov/2018:{} +0100] \"{} {} HTTP/1.1\" 200 123",
            key, time, method, path
        )
    }

    fn read_all_rows(dir: &Path) -> Vec<SessionRecord> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
            .iter()
            .flat_map(|p| {
                std::fs::read_to_string(p)
                    .unwrap()
                    .lines()
                    .skip(1)
                    .map(|l| SessionRecord::from_csv_line(l).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_split_two_keys() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let log = write_log(
            dir.path(),
            &[
                &log_line("alice", "08:00:00", "GET", "/a"),
                &log_line("bob", "08:00:01", "GET", "/b"),
                &log_line("alice", "08:00:05", "GET", "/c"),
            ],
        );

        let splitter = Splitter::new(SplitConfig::default(), Annotator::noop());
        let summary = splitter.run(&log, &out).unwrap();

        assert_eq!(summary.lines_read, 3);
        assert_eq!(summary.entries_dispatched, 3);
        assert_eq!(summary.session_keys, 2);
        assert_eq!(summary.sessions, 2);
        assert_eq!(summary.entries_written, 3);
        assert_eq!(summary.write_errors, 0);

        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 2);
    }

    #[test]
    fn test_unparsable_lines_are_skipped_and_run_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let log = write_log(
            dir.path(),
            &[
                "complete garbage",
                &log_line("alice", "08:00:00", "GET", "/a"),
                "alice - - [not a date] \"GET /x HTTP/1.1\" 200 1",
            ],
        );

        let splitter = Splitter::new(SplitConfig::default(), Annotator::noop());
        let summary = splitter.run(&log, &out).unwrap();

        assert_eq!(summary.lines_read, 3);
        assert_eq!(summary.lines_unparsable, 2);
        assert_eq!(summary.entries_dispatched, 1);
    }

    #[test]
    fn test_ignore_list_filters_before_gap_computation() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let ignore = dir.path().join("ignored.txt");
        std::fs::write(&ignore, "GET /health\n").unwrap();

        let log = write_log(
            dir.path(),
            &[
                &log_line("alice", "08:00:00", "GET", "/a"),
                &log_line("alice", "08:00:10", "GET", "/health"),
                &log_line("alice", "08:00:20", "GET", "/b"),
            ],
        );

        let splitter = Splitter::new(SplitConfig::default(), Annotator::noop())
            .with_ignore_list(&ignore)
            .unwrap();
        let summary = splitter.run(&log, &out).unwrap();

        assert_eq!(summary.entries_ignored, 1);

        let rows = read_all_rows(&out);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.path != "/health"));
        // The gap spans the ignored entry without corruption.
        assert_eq!(rows[0].delay_ms, 20_000);
    }

    #[test]
    fn test_missing_ignore_list_is_fatal() {
        let splitter = Splitter::new(SplitConfig::default(), Annotator::noop());
        let err = splitter
            .with_ignore_list(Path::new("/nonexistent/ignored.txt"))
            .map(|_| ())
            .unwrap_err();
        assert!(err.to_string().contains("ignore list"));
    }

    #[test]
    fn test_invalid_utf8_line_counts_as_unparsable() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let path = dir.path().join("access.log");

        let mut data = log_line("alice", "08:00:00", "GET", "/a").into_bytes();
        data.push(b'\n');
        data.extend_from_slice(
            b"ali\xffce - - [05/Nov/2018:08:00:10 +0100] \"GET /x HTTP/1.1\" 200 1\n",
        );
        std::fs::write(&path, data).unwrap();

        let splitter = Splitter::new(SplitConfig::default(), Annotator::noop());
        let summary = splitter.run(&path, &out).unwrap();

        assert_eq!(summary.lines_read, 2);
        assert_eq!(summary.lines_unparsable, 1);
        assert_eq!(summary.entries_dispatched, 1);
        // No session is seeded from a replacement-character key.
        assert_eq!(summary.session_keys, 1);
    }

    #[test]
    fn test_mmap_path_reads_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let path = dir.path().join("big.log");

        let line = log_line("alice", "08:00:00", "GET", "/a");
        let count = (MMAP_THRESHOLD / line.len() as u64) + 100;
        {
            let mut f = std::io::BufWriter::new(std::fs::File::create(&path).unwrap());
            for _ in 0..count {
                writeln!(f, "{}", line).unwrap();
            }
        }
        assert!(std::fs::metadata(&path).unwrap().len() > MMAP_THRESHOLD);

        let splitter = Splitter::new(SplitConfig::default(), Annotator::noop());
        let summary = splitter.run(&path, &out).unwrap();
        assert_eq!(summary.lines_read, count);
        assert_eq!(summary.entries_written, count);
    }
}
