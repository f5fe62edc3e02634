//! Per-session-key collector worker.
//!
//! Each distinct session key gets one long-lived worker thread fed through an
//! unbounded FIFO channel that only the driver writes to, so entries for a
//! key are processed in exactly the order they were dispatched. The worker
//! runs the session state machine: a gap of more than 30 minutes between two
//! consecutive entries closes the current CSV file and starts a new one.
//!
//! The annotator runs inside the worker, before the state machine — an entry
//! it drops never influences the delay computation of its neighbors.

use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::SplitConfig;
use crate::pipeline::annotator::Annotator;
use crate::pipeline::parser::{csv_header, LogEntry};

/// Message sent to a collector worker. An explicit end-of-stream variant
/// instead of a sentinel entry — real data can never be mistaken for it.
pub enum CollectorMsg {
    Entry(LogEntry),
    EndOfStream,
}

#[derive(Debug, Default, Clone)]
pub struct CollectorStats {
    pub entries_written: u64,
    pub entries_dropped: u64,
    pub sessions: u64,
    pub write_errors: u64,
}

/// Channel + join handle of a spawned collector. The driver sends
/// `EndOfStream` after input exhaustion and then joins the handle, so
/// shutdown is provably complete rather than best-effort.
pub struct CollectorHandle {
    pub tx: Sender<CollectorMsg>,
    pub handle: JoinHandle<CollectorStats>,
}

/// Spawn the collector thread for one session key.
pub fn spawn(
    key: String,
    out_dir: PathBuf,
    config: SplitConfig,
    annotator: Arc<Annotator>,
) -> CollectorHandle {
    let (tx, rx) = unbounded();
    let handle = std::thread::spawn(move || {
        let mut collector = SessionCollector::new(key, out_dir, config, annotator);
        collector.run(rx);
        collector.stats
    });
    CollectorHandle { tx, handle }
}

struct SessionCollector {
    key: String,
    key_hash: u64,
    out_dir: PathBuf,
    config: SplitConfig,
    annotator: Arc<Annotator>,
    writer: Option<BufWriter<File>>,
    filename: String,
    pending: Option<LogEntry>,
    session_counter: u32,
    stats: CollectorStats,
}

impl SessionCollector {
    fn new(key: String, out_dir: PathBuf, config: SplitConfig, annotator: Arc<Annotator>) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let key_hash = hasher.finish();

        Self {
            key,
            key_hash,
            out_dir,
            config,
            annotator,
            writer: None,
            filename: String::new(),
            pending: None,
            session_counter: 1,
            stats: CollectorStats::default(),
        }
    }

    fn run(&mut self, rx: Receiver<CollectorMsg>) {
        loop {
            match rx.recv() {
                Ok(CollectorMsg::Entry(entry)) => {
                    match self.annotator.annotate(entry) {
                        Some(annotated) => self.process(annotated),
                        None => self.stats.entries_dropped += 1,
                    }
                }
                Ok(CollectorMsg::EndOfStream) => break,
                Err(_) => {
                    // Driver went away without signaling. Flushing the
                    // accumulated session beats silently losing it.
                    tracing::warn!(key = %self.key, "channel closed without end-of-stream");
                    break;
                }
            }
        }
        self.finish();
    }

    fn process(&mut self, entry: LogEntry) {
        match self.pending.take() {
            None => {
                self.open_next_file();
                self.pending = Some(entry);
            }
            Some(mut prev) => {
                // Clock skew can produce negative gaps; delays are never
                // negative.
                let gap = (entry.timestamp - prev.timestamp).num_milliseconds().max(0);

                if gap <= self.config.gap_threshold_ms {
                    prev.delay_ms = match self.config.delay_cap_ms {
                        Some(cap) => gap.min(cap),
                        None => gap,
                    };
                    self.write_row(&prev);
                } else {
                    // Session boundary: the closing entry keeps the delay it
                    // already carries.
                    self.write_row(&prev);
                    self.close_file();
                    self.open_next_file();
                }

                self.pending = Some(entry);
            }
        }
    }

    /// Flush the held entry with the terminal delay and close the file.
    fn finish(&mut self) {
        if let Some(mut last) = self.pending.take() {
            last.delay_ms = self.config.terminal_delay_ms;
            self.write_row(&last);
        }
        self.close_file();
    }

    fn open_next_file(&mut self) {
        // Key hash + per-worker counter: unique across workers without
        // coordination.
        self.filename = format!("session-{:x}-{}.csv", self.key_hash, self.session_counter);
        self.session_counter += 1;

        tracing::info!(key = %self.key, file = %self.filename, "writing session");

        match self.create_file() {
            Ok(writer) => {
                self.writer = Some(writer);
                self.stats.sessions += 1;
            }
            Err(e) => {
                tracing::error!(key = %self.key, file = %self.filename, error = %e, "could not open session file");
                self.writer = None;
                self.stats.write_errors += 1;
            }
        }
    }

    fn create_file(&self) -> Result<BufWriter<File>> {
        let path = self.out_dir.join(&self.filename);
        let file = File::create(&path)
            .with_context(|| format!("creating session file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", csv_header(self.config.csv_style))
            .with_context(|| format!("writing CSV header to {}", path.display()))?;
        Ok(writer)
    }

    fn write_row(&mut self, entry: &LogEntry) {
        if entry.method == "POST" || entry.method == "PUT" {
            tracing::info!(method = %entry.method, path = %entry.path, file = %self.filename, "request with body");
        }

        let row = entry.to_record().to_csv_row(self.config.csv_style);
        match self.writer.as_mut() {
            Some(writer) => match writeln!(writer, "{}", row) {
                Ok(()) => self.stats.entries_written += 1,
                Err(e) => {
                    tracing::error!(key = %self.key, file = %self.filename, error = %e, "could not write CSV row");
                    self.stats.write_errors += 1;
                }
            },
            // Open already failed and was reported; the row has nowhere to go.
            None => self.stats.write_errors += 1,
        }
    }

    fn close_file(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::error!(key = %self.key, file = %self.filename, error = %e, "could not flush session file");
                self.stats.write_errors += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CsvStyle;
    use crate::pipeline::parser::SessionRecord;
    use chrono::{DateTime, Duration, FixedOffset};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn ts(seconds: i64) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2018-11-05T08:00:00+01:00").unwrap()
            + Duration::seconds(seconds)
    }

    fn entry(seconds: i64, path: &str) -> LogEntry {
        LogEntry::new("tid", ts(seconds), "GET", path)
    }

    fn run_collector(
        config: SplitConfig,
        annotator: Annotator,
        entries: Vec<LogEntry>,
        out_dir: &Path,
    ) -> CollectorStats {
        let handle = spawn(
            "tid".to_string(),
            out_dir.to_path_buf(),
            config,
            Arc::new(annotator),
        );
        for e in entries {
            handle.tx.send(CollectorMsg::Entry(e)).unwrap();
        }
        handle.tx.send(CollectorMsg::EndOfStream).unwrap();
        handle.handle.join().unwrap()
    }

    fn session_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    fn read_rows(path: &Path) -> Vec<SessionRecord> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .skip(1)
            .map(|l| SessionRecord::from_csv_line(l).unwrap())
            .collect()
    }

    #[test]
    fn test_delays_equal_gap_to_successor() {
        let dir = tempfile::tempdir().unwrap();
        let stats = run_collector(
            SplitConfig::default(),
            Annotator::noop(),
            vec![entry(0, "/a"), entry(10, "/b"), entry(25, "/c")],
            dir.path(),
        );

        let files = session_files(dir.path());
        assert_eq!(files.len(), 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.entries_written, 3);

        let rows = read_rows(&files[0]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].delay_ms, 10_000);
        assert_eq!(rows[1].delay_ms, 15_000);
        // Last entry gets the terminal delay.
        assert_eq!(rows[2].delay_ms, 30_000);
        assert_eq!(rows[0].path, "/a");
        assert_eq!(rows[2].path, "/c");
    }

    #[test]
    fn test_gap_over_threshold_starts_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let stats = run_collector(
            SplitConfig::default(),
            Annotator::noop(),
            vec![entry(0, "/a"), entry(31 * 60, "/b")],
            dir.path(),
        );

        let files = session_files(dir.path());
        assert_eq!(files.len(), 2);
        assert_eq!(stats.sessions, 2);

        // The entry before the break keeps its untouched delay.
        let first = read_rows(&files[0]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].path, "/a");
        assert_eq!(first[0].delay_ms, 0);

        let second = read_rows(&files[1]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].path, "/b");
        assert_eq!(second[0].delay_ms, 30_000);
    }

    #[test]
    fn test_exact_threshold_gap_stays_in_session() {
        let dir = tempfile::tempdir().unwrap();
        run_collector(
            SplitConfig::default(),
            Annotator::noop(),
            vec![entry(0, "/a"), entry(30 * 60, "/b")],
            dir.path(),
        );

        let files = session_files(dir.path());
        assert_eq!(files.len(), 1);
        let rows = read_rows(&files[0]);
        assert_eq!(rows[0].delay_ms, 30 * 60 * 1000);
    }

    #[test]
    fn test_delay_cap() {
        let dir = tempfile::tempdir().unwrap();
        let config = SplitConfig {
            delay_cap_ms: Some(5_000),
            terminal_delay_ms: 0,
            ..SplitConfig::default()
        };
        run_collector(
            config,
            Annotator::noop(),
            vec![entry(0, "/a"), entry(60, "/b")],
            dir.path(),
        );

        let rows = read_rows(&session_files(dir.path())[0]);
        assert_eq!(rows[0].delay_ms, 5_000);
        assert_eq!(rows[1].delay_ms, 0);
    }

    #[test]
    fn test_negative_gap_clamps_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        run_collector(
            SplitConfig::default(),
            Annotator::noop(),
            vec![entry(10, "/a"), entry(0, "/b")],
            dir.path(),
        );

        let rows = read_rows(&session_files(dir.path())[0]);
        assert_eq!(rows[0].delay_ms, 0);
    }

    #[test]
    fn test_dropped_entries_do_not_affect_gaps() {
        let annotator = Annotator::from_models(
            serde_json::from_str(
                r#"{"endpoints": [{
                    "id": "a",
                    "path": "/keep/{x}",
                    "method": "GET",
                    "parameters": [{"name": "x", "type": "path"}]
                }]}"#,
            )
            .unwrap(),
            serde_json::from_str(r#"{"bindings": {"a": {"x": "${Input_x}"}}}"#).unwrap(),
        );

        let dir = tempfile::tempdir().unwrap();
        let stats = run_collector(
            SplitConfig::default(),
            annotator,
            vec![
                entry(0, "/keep/one"),
                entry(10, "/drop/me"),
                entry(20, "/keep/two"),
            ],
            dir.path(),
        );

        assert_eq!(stats.entries_dropped, 1);
        let rows = read_rows(&session_files(dir.path())[0]);
        assert_eq!(rows.len(), 2);
        // Gap computed between the surviving entries, not against the
        // dropped one.
        assert_eq!(rows[0].delay_ms, 20_000);
        assert_eq!(rows[0].path, "/keep/${Input_x}");
    }

    #[test]
    fn test_all_entries_dropped_leaves_no_file() {
        let annotator = Annotator::from_models(
            serde_json::from_str(r#"{"endpoints": []}"#).unwrap(),
            serde_json::from_str(r#"{"bindings": {}}"#).unwrap(),
        );

        let dir = tempfile::tempdir().unwrap();
        let stats = run_collector(
            SplitConfig::default(),
            annotator,
            vec![entry(0, "/a"), entry(5, "/b")],
            dir.path(),
        );

        assert_eq!(stats.entries_dropped, 2);
        assert_eq!(stats.sessions, 0);
        assert!(session_files(dir.path()).is_empty());
    }

    #[test]
    fn test_bare_style_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = SplitConfig {
            csv_style: CsvStyle::Bare,
            ..SplitConfig::default()
        };
        run_collector(
            config,
            Annotator::noop(),
            vec![entry(0, "/a"), entry(3, "/b")],
            dir.path(),
        );

        let content = std::fs::read_to_string(&session_files(dir.path())[0]).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "delay,method,request");
        assert_eq!(lines[1], "3000,GET,/a");
        assert_eq!(lines[2], "30000,GET,/b");
    }
}
