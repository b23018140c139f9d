mod events;
mod state;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ghostpress::{init_logging, JobSnapshot, JobStatus, LogFormat, SessionState, StatusCounts};
use log::{info, warn};
use serde::Serialize;

use state::{AppState, SettingsOverrides};

#[derive(Parser, Debug)]
#[command(name = "ghostpress")]
#[command(version)]
#[command(about = "Compress images and videos locally", long_about = None)]
struct Args {
    /// Files or directories to compress
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory (defaults to next to each source)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Quality from 0 to 100
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
    quality: Option<u8>,

    /// Target format, e.g. webp or mp4 ("original" keeps the source format)
    #[arg(short, long)]
    format: Option<String>,

    /// Keep metadata instead of stripping it
    #[arg(long)]
    keep_metadata: bool,

    /// Downscale factor in (0, 1]
    #[arg(long)]
    scale: Option<f32>,

    /// Log output: pretty or json
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Print a JSON report instead of the plain summary
    #[arg(long)]
    json: bool,
}

/// Machine-readable outcome of a run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport {
    counts: StatusCounts,
    bytes_saved: i64,
    written: Vec<PathBuf>,
    jobs: Vec<JobSnapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format).context("Failed to initialize logging")?;

    info!("Starting GhostPress v{}", env!("CARGO_PKG_VERSION"));

    let overrides = SettingsOverrides {
        quality: args.quality,
        format: args.format.clone(),
        keep_metadata: args.keep_metadata,
        scale: args.scale,
    };
    let config = AppState::load_config(args.config.as_deref(), &overrides)?;
    let mut state = AppState::new(config, args.output.clone());
    info!("Execution mode: {:?}", state.config.engine.mode);

    let orchestrator = state.orchestrator.clone();
    match orchestrator.initialize_engine().await {
        SessionState::Ready => info!("Codec engine ready"),
        SessionState::ReadySimulated => {
            warn!("Codec engine unavailable, running in simulation mode")
        }
        other => warn!("Codec engine in unexpected state: {:?}", other),
    }

    let submitted = state.submit_paths(&args.paths)?;
    if submitted == 0 {
        bail!("No supported image or video files found");
    }

    let bridge = events::start_event_bridge(orchestrator.store());
    orchestrator.start_all()?;
    orchestrator.wait_for_idle().await;
    bridge.abort();

    let written = state.write_results()?;
    let store = orchestrator.store();
    let counts = store.counts();
    let saved = store.total_bytes_saved();

    if args.json {
        let report = RunReport {
            counts,
            bytes_saved: saved,
            written,
            jobs: store.snapshot(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for path in &written {
            println!("{}", path.display());
        }
        println!(
            "{} compressed, {} failed, {} saved",
            counts.completed,
            counts.error,
            format_bytes(saved)
        );
    }

    if counts.error > 0 {
        for job in store.snapshot() {
            if job.status == JobStatus::Error {
                if let Some(error) = job.error {
                    eprintln!("{}: {}", job.name, error.message);
                }
            }
        }
        bail!("{} of {} file(s) failed", counts.error, counts.total());
    }
    Ok(())
}

fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let sign = if bytes < 0 { "-" } else { "" };
    let mut value = bytes.unsigned_abs() as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{} {}", sign, value as u64, UNITS[unit])
    } else {
        format!("{}{:.1} {}", sign, value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(-1536), "-1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "ghostpress",
            "--quality",
            "60",
            "--log-format",
            "json",
            "a.png",
            "clips",
        ])
        .unwrap();
        assert_eq!(args.quality, Some(60));
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.paths.len(), 2);
        assert!(!args.json);
        assert!(Args::try_parse_from(["ghostpress", "--json", "a.png"]).unwrap().json);

        assert!(Args::try_parse_from(["ghostpress", "--quality", "101", "a.png"]).is_err());
        assert!(Args::try_parse_from(["ghostpress"]).is_err());
    }
}
