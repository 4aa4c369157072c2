use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

use crate::encoding::Resolution;
use crate::error::AppError;

/// Probed description of a media file.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub resolution: Resolution,
    /// Bits per second, from the stream entry or the container format.
    pub bitrate: u64,
    pub duration_secs: f64,
    pub codec_name: String,
    pub frame_rate: (u32, u32),
}

/// Probe a file with ffprobe.
pub fn probe(ffprobe: &str, path: &Path) -> Result<MediaInfo, AppError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,codec_name,r_frame_rate,avg_frame_rate,bit_rate",
            "-show_entries",
            "format=duration,bit_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .map_err(|e| AppError::Probe(format!("failed to execute {}: {}", ffprobe, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Probe(format!(
            "ffprobe failed for {}: {}",
            path.display(),
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!("ffprobe {}: {}", path.display(), stdout.trim());

    parse_probe_output(path, &stdout)
}

/// Parse ffprobe's JSON output into a `MediaInfo`.
fn parse_probe_output(path: &Path, json: &str) -> Result<MediaInfo, AppError> {
    let data: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| AppError::Probe(format!("failed to parse ffprobe output: {}", e)))?;

    let stream = data
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Probe(format!("no video stream in {}", path.display())))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(AppError::Probe(format!(
                "video stream in {} has no usable dimensions",
                path.display()
            )));
        }
    };

    let bitrate = stream
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<u64>().ok())
        .or_else(|| {
            data.format
                .as_ref()
                .and_then(|f| f.bit_rate.as_deref())
                .and_then(|b| b.parse::<u64>().ok())
        })
        .unwrap_or(0);

    let duration_secs = data
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let frame_rate = parse_frame_rate(
        stream
            .r_frame_rate
            .as_deref()
            .or(stream.avg_frame_rate.as_deref()),
    );

    Ok(MediaInfo {
        path: path.to_path_buf(),
        resolution: Resolution::Exact { width, height },
        bitrate,
        duration_secs,
        codec_name: stream.codec_name.unwrap_or_else(|| "unknown".to_string()),
        frame_rate,
    })
}

/// Parse ffprobe's "num/den" frame rate format.
fn parse_frame_rate(rate_str: Option<&str>) -> (u32, u32) {
    rate_str
        .and_then(|s| {
            let (num, den) = s.split_once('/')?;
            let num = num.parse::<u32>().ok()?;
            let den = den.parse::<u32>().ok()?;
            if den > 0 { Some((num, den)) } else { None }
        })
        .unwrap_or((0, 1))
}

// JSON deserialization structures

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<VideoStream>,
    format: Option<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoStream {
    width: Option<u32>,
    height: Option<u32>,
    codec_name: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    bit_rate: Option<String>,
}
