use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::AppError;

/// Pull the average PSNR and SSIM out of ffmpeg's filter summary lines:
///
/// ```text
/// [Parsed_psnr_0 @ 0x...] PSNR y:41.2 u:45.6 v:44.9 average:42.1 min:38.0 max:47.3
/// [Parsed_ssim_1 @ 0x...] SSIM Y:0.98 (17.4) U:0.97 (15.8) V:0.97 (15.6) All:0.98 (16.9)
/// ```
///
/// A score that stays at zero is reported with a diagnostic but is not an
/// error; the caller decides what a zero means.
pub fn parse_psnr_ssim(stderr: &str) -> Result<(f64, f64), AppError> {
    let float = r"(?:[.0-9]+|inf)";
    let psnr_regex = Regex::new(&format!(
        r"PSNR y:{f} u:{f} v:{f} average:(?P<psnr>[.0-9]+)",
        f = float
    ))
    .map_err(|e| AppError::Score(e.to_string()))?;
    let ssim_regex = Regex::new(&format!(
        r"SSIM Y:[.0-9]+ \({f}\) U:[.0-9]+ \({f}\) V:[.0-9]+ \({f}\) All:(?P<ssim>[.0-9]+)",
        f = float
    ))
    .map_err(|e| AppError::Score(e.to_string()))?;

    let mut psnr = 0.0;
    let mut ssim = 0.0;

    for line in stderr.lines() {
        if let Some(captures) = psnr_regex.captures(line)
            && let Ok(value) = captures["psnr"].parse::<f64>()
        {
            psnr = value;
        }
        if let Some(captures) = ssim_regex.captures(line)
            && let Ok(value) = captures["ssim"].parse::<f64>()
        {
            ssim = value;
        }
    }

    if psnr * ssim == 0.0 {
        warn!("psnr/ssim parsed as zero; ffmpeg filter output may have changed format");
    }

    Ok((psnr, ssim))
}

/// JSON structure of the libvmaf log file.
#[derive(Debug, Deserialize)]
struct VmafLog {
    pooled_metrics: PooledMetrics,
}

#[derive(Debug, Deserialize)]
struct PooledMetrics {
    vmaf: MetricStats,
}

#[derive(Debug, Deserialize)]
struct MetricStats {
    mean: f64,
}

/// Parse the pooled mean VMAF score from a libvmaf JSON log.
pub fn parse_vmaf_log(json: &str) -> Result<f64, AppError> {
    let log: VmafLog = serde_json::from_str(json)
        .map_err(|e| AppError::Score(format!("failed to parse VMAF JSON log: {}", e)))?;
    Ok(log.pooled_metrics.vmaf.mean)
}

/// Recognize the stderr of an ffmpeg build without libvmaf so the operator
/// gets a pointed message instead of a generic exit code.
pub fn vmaf_unavailable(stderr: &str) -> bool {
    stderr.contains("No such filter: 'libvmaf'")
        || stderr.contains("Unknown libvmaf")
        || stderr.contains("Option model not found")
}
