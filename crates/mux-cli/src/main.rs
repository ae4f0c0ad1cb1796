//! muxsoak: loopback soak run for the mux session layer.
//!
//! Allocates a batch of sessions on one manager, pushes random chunks
//! through them in both directions, and reports byte counts and scheduler
//! activity.

mod config;
mod soak;

use anyhow::Result;
use clap::Parser;
use mux_core::TransferType;
use soak::{SoakReport, SoakSettings};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// muxsoak: exercise the session manager and token scheduler
#[derive(Parser)]
#[command(name = "muxsoak", version, about = "Loopback soak run for the mux session layer")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.mux/soak.toml")]
    config: String,

    /// Number of concurrent sessions
    #[arg(short, long)]
    sessions: Option<u16>,

    /// Chunks per session in each direction
    #[arg(short, long)]
    chunks: Option<usize>,

    /// Payload bytes per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Transfer type (stream or packet)
    #[arg(short, long)]
    transfer: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("muxsoak: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::Config::load(&config::expand_tilde(&cli.config))?;

    // CLI overrides config.
    let transfer: TransferType = cli
        .transfer
        .as_deref()
        .unwrap_or(&cfg.soak.transfer)
        .parse()?;
    let settings = SoakSettings {
        sessions: cli.sessions.unwrap_or(cfg.soak.sessions),
        chunks_per_session: cli.chunks.unwrap_or(cfg.soak.chunks_per_session),
        chunk_size: cli.chunk_size.unwrap_or(cfg.soak.chunk_size),
        transfer,
    };

    let report = soak::run(&settings, cfg.manager).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SoakReport) {
    println!(
        "{} {} sessions, {} bytes up, {} bytes down, {} scan passes, {} ms",
        report.sessions,
        report.transfer,
        report.uplink_bytes,
        report.downlink_bytes,
        report.scan_passes,
        report.elapsed_ms
    );
    println!("{:<8} {:>12} {:>12}", "SESSION", "UPLINK", "DOWNLINK");
    for s in &report.per_session {
        println!("{:<8} {:>12} {:>12}", s.id, s.uplink_bytes, s.downlink_bytes);
    }
    if !report.idle_closed {
        println!("warning: manager did not close on idle");
    }
}
