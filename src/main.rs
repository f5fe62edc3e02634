mod combine;
mod config;
mod error_tracker;
mod model;
mod pipeline;
mod split;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};

use config::{CombineConfig, CsvStyle, SplitConfig};
use model::{AnnotationModel, Application};
use pipeline::annotator::Annotator;
use split::Splitter;

fn parse_csv_style(s: &str) -> anyhow::Result<CsvStyle> {
    match s.to_lowercase().as_str() {
        "quoted" | "extended" => Ok(CsvStyle::Quoted),
        "bare" | "minimal" => Ok(CsvStyle::Bare),
        _ => anyhow::bail!("Unknown CSV style: {}. Use 'quoted' or 'bare'", s),
    }
}

#[derive(Parser)]
#[command(name = "sessionizer", version, about = "Splits web access logs into per-user load-test sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split an access log into one CSV file per user session
    Split {
        /// Path to the access log file
        log_file: PathBuf,

        /// Directory for the session CSV files
        out_dir: PathBuf,

        /// Newline-delimited "METHOD path" literals to drop before splitting
        ignore_file: Option<PathBuf>,

        /// Endpoint model JSON (enables path annotation)
        #[arg(requires = "annotation_model")]
        application_model: Option<PathBuf>,

        /// Annotation model JSON binding endpoint parameters to inputs
        #[arg(requires = "application_model")]
        annotation_model: Option<PathBuf>,

        /// Cap each in-session delay at this many milliseconds
        #[arg(long)]
        cap_delay_ms: Option<i64>,

        /// Delay written for the last entry of each session
        #[arg(long, default_value_t = config::DEFAULT_TERMINAL_DELAY_MS)]
        terminal_delay_ms: i64,

        /// CSV row variant: quoted (default) or bare
        #[arg(long, default_value = "quoted")]
        csv_style: String,
    },

    /// Combine split sessions into longer synthetic sessions
    Combine {
        /// Directory of session CSV files produced by split
        sessions_dir: PathBuf,

        /// Output directory (one subdirectory per iteration)
        out_dir: PathBuf,

        /// Number of combined sessions per iteration
        num_sessions: u32,

        /// Number of iterations
        num_iterations: u32,

        /// Minimum cumulative delay of a combined session in milliseconds
        #[arg(long, default_value_t = config::DEFAULT_MIN_SESSION_MS)]
        min_session_ms: i64,

        /// Delay between concatenated sessions in milliseconds
        #[arg(long, default_value_t = config::DEFAULT_INTER_SESSION_WAIT_MS)]
        inter_session_wait_ms: i64,

        /// CSV row variant: quoted (default) or bare
        #[arg(long, default_value = "quoted")]
        csv_style: String,

        /// Number of combiner workers (default: num_cpus)
        #[arg(long, default_value = "0")]
        workers: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sessionizer=info".parse()?),
        )
        .init();

    match cli.command {
        Commands::Split {
            log_file,
            out_dir,
            ignore_file,
            application_model,
            annotation_model,
            cap_delay_ms,
            terminal_delay_ms,
            csv_style,
        } => {
            let config = SplitConfig {
                delay_cap_ms: cap_delay_ms,
                terminal_delay_ms,
                csv_style: parse_csv_style(&csv_style)?,
                ..SplitConfig::default()
            };
            cmd_split(
                &log_file,
                &out_dir,
                ignore_file.as_deref(),
                application_model.as_deref(),
                annotation_model.as_deref(),
                config,
            )?;
        }
        Commands::Combine {
            sessions_dir,
            out_dir,
            num_sessions,
            num_iterations,
            min_session_ms,
            inter_session_wait_ms,
            csv_style,
            workers,
        } => {
            let mut config = CombineConfig::new(num_sessions, num_iterations);
            config.min_session_ms = min_session_ms;
            config.inter_session_wait_ms = inter_session_wait_ms;
            config.csv_style = parse_csv_style(&csv_style)?;
            config.workers = workers;
            cmd_combine(&sessions_dir, &out_dir, config)?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// split subcommand
// ---------------------------------------------------------------------------

fn cmd_split(
    log_file: &std::path::Path,
    out_dir: &std::path::Path,
    ignore_file: Option<&std::path::Path>,
    application_model: Option<&std::path::Path>,
    annotation_model: Option<&std::path::Path>,
    config: SplitConfig,
) -> anyhow::Result<()> {
    let start = Instant::now();

    let annotator = match (application_model, annotation_model) {
        (Some(app_path), Some(ann_path)) => {
            tracing::info!(application = %app_path.display(), annotation = %ann_path.display(), "loading endpoint model");
            Annotator::from_models(Application::load(app_path)?, AnnotationModel::load(ann_path)?)
        }
        _ => Annotator::noop(),
    };

    let mut splitter = Splitter::new(config, annotator);
    if let Some(path) = ignore_file {
        splitter = splitter.with_ignore_list(path)?;
    }

    let summary = splitter.run(log_file, out_dir)?;

    eprintln!("\n=== Split Results ===");
    eprintln!("Lines read: {}", summary.lines_read);
    eprintln!("Session keys: {}", summary.session_keys);
    eprintln!("Sessions written: {}", summary.sessions);
    eprintln!("Entries written: {}", summary.entries_written);
    if summary.lines_unparsable > 0 {
        eprintln!("Unparsable lines: {}", summary.lines_unparsable);
    }
    if summary.entries_ignored > 0 {
        eprintln!("Ignored entries: {}", summary.entries_ignored);
    }
    if summary.entries_dropped > 0 {
        eprintln!("Dropped (no endpoint match): {}", summary.entries_dropped);
    }
    if summary.write_errors > 0 {
        eprintln!("Write errors: {}", summary.write_errors);
    }
    eprintln!("Total: {:.3}s", start.elapsed().as_secs_f64());

    Ok(())
}

// ---------------------------------------------------------------------------
// combine subcommand
// ---------------------------------------------------------------------------

fn cmd_combine(
    sessions_dir: &std::path::Path,
    out_dir: &std::path::Path,
    config: CombineConfig,
) -> anyhow::Result<()> {
    let start = Instant::now();

    let summary = combine::run(sessions_dir, out_dir, &config)?;

    eprintln!("\n=== Combine Results ===");
    eprintln!("Combined sessions written: {}", summary.outputs_written);
    if summary.outputs_failed > 0 {
        eprintln!("Failed: {}", summary.outputs_failed);
    }
    eprintln!("Total: {:.3}s", start.elapsed().as_secs_f64());

    Ok(())
}
