mod config;
mod encoding;
mod error;
mod gateway;
mod logging;
mod probe;
mod search;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use humansize::{DECIMAL, format_size};
use tracing::{info, warn};

use config::Tools;
use encoding::{Encoding, Resolution};
use gateway::ToolGateway;
use search::{CRF_MAX, CRF_MIN, Searcher};

/// Search candidate resolutions for the CRF that reproduces an anchor
/// encode's VMAF score, and report the cheapest perceptually-equivalent
/// encode.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Input video path
    #[arg(short, long)]
    input: PathBuf,

    /// Anchor resolution (WxH or Np, e.g. 1080p)
    #[arg(short = 's', long)]
    anchor_size: String,

    /// Anchor CRF
    #[arg(short = 'q', long)]
    anchor_crf: f64,

    /// Candidate resolutions to search, comma separated (e.g. 720p,480p)
    #[arg(short = 'd', long, value_delimiter = ',', required = true)]
    search_sizes: Vec<String>,

    /// Limit scoring to the first N frames
    #[arg(long)]
    frames: Option<u32>,

    /// Directory for encodes and raw frame dumps (default: timestamped)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Per-probe timeout in seconds; a timed-out probe abandons its
    /// resolution
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Tool configuration file (default: the per-user tools.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init_logging();
    let args = Args::parse();

    let tools = match &args.config {
        Some(path) => Tools::load_from_file(path)?,
        None => Tools::load(),
    };

    if !(CRF_MIN..=CRF_MAX).contains(&args.anchor_crf) {
        warn!(
            "anchor crf {:.1} is outside the search domain [{}, {}]; \
             candidates are unlikely to converge",
            args.anchor_crf, CRF_MIN, CRF_MAX
        );
    }

    let media = probe::probe(&tools.ffprobe, &args.input)
        .with_context(|| format!("unable to probe {}", args.input.display()))?;
    info!(
        "source: {} {} {} bps",
        media.codec_name, media.resolution, media.bitrate
    );

    let source = Encoding::from_media(&media);
    let anchor = Encoding::new(Resolution::parse(&args.anchor_size)?, args.anchor_crf);

    let candidates = args
        .search_sizes
        .iter()
        .map(|s| Resolution::parse(s))
        .collect::<Result<Vec<_>, _>>()?;

    let work_dir = args.work_dir.unwrap_or_else(|| {
        PathBuf::from(format!(
            "sizeopt_{}",
            chrono::Local::now().format("%y%m%d_%H%M")
        ))
    });

    let cancel = Arc::new(AtomicBool::new(false));
    let gateway = ToolGateway::new(
        tools,
        work_dir,
        cancel,
        args.timeout_secs.map(Duration::from_secs),
    )?;

    let searcher = Searcher::new(&gateway, &source, args.frames);
    let recommendation = searcher.search(&anchor, &candidates)?;

    println!("anchor: {}", describe(&recommendation.anchor));
    match &recommendation.better {
        Some(better) => {
            let saved = 100.0
                - 100.0 * better.bitrate as f64 / recommendation.anchor.bitrate.max(1) as f64;
            println!("better: {} ({:.1}% bitrate saved)", describe(better), saved);
        }
        None => println!("anchor remains best: no candidate matched its quality for less"),
    }

    info!("done");
    Ok(())
}

/// One-line summary of an encode, with its on-disk size when available.
fn describe(encoding: &Encoding) -> String {
    let size = encoding
        .path
        .as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| format!(", {}", format_size(m.len(), DECIMAL)))
        .unwrap_or_default();

    format!(
        "{} crf {:.2} vmaf {:.2} @ {:.0} kbps{}",
        encoding.resolution,
        encoding.crf,
        encoding.vmaf,
        encoding.bitrate as f64 / 1000.0,
        size
    )
}
