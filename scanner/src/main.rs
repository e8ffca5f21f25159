//! LTE Cell Scanner Main Application
//!
//! Loads a baseband capture, runs the blind cell search and prints the
//! decoded cells.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use capture::CaptureBuffer;
use searcher::{search_cells, SearchConfig};

/// LTE downlink cell scanner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a recorded capture file
    capture: PathBuf,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Override the configured frequency search span, in Hz
    #[arg(long)]
    freq_span: Option<f64>,

    /// Override the configured frequency search step, in Hz
    #[arg(long)]
    freq_step: Option<f64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(env_filter).with_target(true).init();

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str::<SearchConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => SearchConfig::default(),
    };
    if let Some(span) = args.freq_span {
        config.freq_span = span;
    }
    if let Some(step) = args.freq_step {
        config.freq_step = step;
    }

    let cap = CaptureBuffer::load(&args.capture)
        .with_context(|| format!("loading capture {}", args.capture.display()))?;
    info!(
        fc_requested = cap.fc_requested,
        fc_programmed = cap.fc_programmed,
        fs_programmed = cap.fs_programmed,
        n_samples = cap.samples.len(),
        "capture loaded"
    );

    let f_search_set = config.f_search_set().context("invalid search grid")?;
    info!(n_freq = f_search_set.len(), "starting cell search");

    let cells = search_cells(&cap, &f_search_set, &config)?;
    if cells.is_empty() {
        warn!("no cells found");
        return Ok(());
    }

    for cell in &cells {
        let synced = &cell.refined.tuned.synced;
        println!("cell id {:4}  {:?} {:?}", cell.n_id_cell(), synced.duplex_mode, synced.cp_type);
        println!("  ports      {}", cell.n_ports);
        println!("  bandwidth  {} RB", cell.bandwidth.n_rb_dl());
        println!("  PHICH      {:?} / {:?}", cell.phich_duration, cell.phich_resource);
        println!("  SFN        {}", cell.sfn);
        println!(
            "  freq off   {:+.1} Hz (fine {:+.1} Hz)",
            cell.refined.freq_superfine, cell.refined.tuned.freq_fine
        );
        println!("  frame at   {:.2} samples", synced.frame_start);
    }
    Ok(())
}
