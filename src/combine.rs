//! Session combiner: builds longer synthetic sessions out of real ones.
//!
//! For every (iteration, slot) pair one worker repeatedly appends a randomly
//! chosen whole session until the cumulative delay reaches the minimum
//! session length. Each worker seeds its RNG from `iteration * 100 + slot`,
//! so a fixed input directory reproduces byte-identical output.

use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::{CombineConfig, CsvStyle};
use crate::pipeline::parser::{csv_header, SessionRecord};

/// Pick budget per worker. Only exhausted when the source directory cannot
/// yield enough delay at all (e.g. every file is header-only).
const MAX_PICKS: u32 = 10_000;

#[derive(Debug, Default)]
pub struct CombineSummary {
    pub outputs_written: u64,
    pub outputs_failed: u64,
}

pub fn run(sessions_dir: &Path, out_dir: &Path, config: &CombineConfig) -> Result<CombineSummary> {
    let mut filenames: Vec<String> = std::fs::read_dir(sessions_dir)
        .with_context(|| format!("reading sessions directory {}", sessions_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    // Sorted for determinism independent of filesystem order.
    filenames.sort();

    if filenames.is_empty() {
        anyhow::bail!("no session files in {}", sessions_dir.display());
    }

    for iteration in 1..=config.num_iterations {
        let dir = out_dir.join(format!("iteration-{}", iteration));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating iteration directory {}", dir.display()))?;
    }

    let num_workers = if config.workers > 0 {
        config.workers
    } else {
        num_cpus::get()
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .build()
        .context("building combiner thread pool")?;

    let tasks: Vec<(u32, u32)> = (1..=config.num_iterations)
        .flat_map(|i| (1..=config.num_sessions).map(move |s| (i, s)))
        .collect();
    tracing::info!(
        outputs = tasks.len(),
        sources = filenames.len(),
        workers = num_workers,
        "combining sessions"
    );

    let results: Vec<Result<()>> = pool.install(|| {
        tasks
            .par_iter()
            .map(|&(iteration, slot)| {
                combine_one(sessions_dir, out_dir, &filenames, iteration, slot, config)
            })
            .collect()
    });

    let mut summary = CombineSummary::default();
    for result in results {
        match result {
            Ok(()) => summary.outputs_written += 1,
            Err(e) => {
                tracing::error!("{:#}", e);
                summary.outputs_failed += 1;
            }
        }
    }

    Ok(summary)
}

fn combine_one(
    sessions_dir: &Path,
    out_dir: &Path,
    filenames: &[String],
    iteration: u32,
    slot: u32,
    config: &CombineConfig,
) -> Result<()> {
    let seed = u64::from(iteration) * 100 + u64::from(slot);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut collected: Vec<SessionRecord> = Vec::new();
    let mut picks = 0u32;

    while total_delay(&collected) < config.min_session_ms {
        picks += 1;
        if picks > MAX_PICKS {
            anyhow::bail!(
                "iteration {} slot {}: no usable session data after {} picks",
                iteration,
                slot,
                MAX_PICKS
            );
        }

        let name = &filenames[rng.gen_range(0..filenames.len())];
        match read_session(&sessions_dir.join(name)) {
            Ok(rows) if rows.is_empty() => {
                tracing::warn!(iteration, slot, file = %name, "empty session file");
            }
            Ok(rows) => {
                collected.extend(rows);
                // The appended session ends with the inter-session wait.
                if let Some(last) = collected.last_mut() {
                    last.delay_ms = config.inter_session_wait_ms;
                }
            }
            Err(e) => {
                // One unreadable source does not abort the worker; it picks
                // again.
                tracing::error!(iteration, slot, file = %name, error = %format!("{:#}", e), "could not read session file");
            }
        }
    }

    write_combined(out_dir, iteration, slot, &collected, config.csv_style)
}

fn total_delay(records: &[SessionRecord]) -> i64 {
    records.iter().map(|r| r.delay_ms).sum()
}

fn read_session(path: &Path) -> Result<Vec<SessionRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    content
        .lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(SessionRecord::from_csv_line)
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("parsing {}", path.display()))
}

fn write_combined(
    out_dir: &Path,
    iteration: u32,
    slot: u32,
    records: &[SessionRecord],
    style: CsvStyle,
) -> Result<()> {
    let path = out_dir
        .join(format!("iteration-{}", iteration))
        .join(format!("session-{}.csv", slot));

    let mut content = String::from(csv_header(style));
    content.push('\n');
    for record in records {
        content.push_str(&record.to_csv_row(style));
        content.push('\n');
    }

    std::fs::write(&path, content)
        .with_context(|| format!("iteration {} slot {}: writing {}", iteration, slot, path.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
