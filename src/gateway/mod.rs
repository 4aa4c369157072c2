pub mod command;
pub mod score;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Tools;
use crate::encoding::{Encoding, Resolution, Scores};
use crate::error::AppError;
use crate::probe;

use command::{RunControl, RunFailure};

/// The encode-and-score capability the search engine runs against.
///
/// The gateway is stateless between calls; every invocation is a pure
/// request/response pair from the engine's point of view. Implementations:
/// `ToolGateway` drives the real external tools, and tests substitute a
/// deterministic in-memory fake.
pub trait EncodeScore: Send + Sync {
    /// Encode `source` at (resolution, crf) and return the resulting
    /// descriptor with its measured bitrate. A shorter-edge resolution is
    /// resolved against the source's own resolution first.
    fn encode(&self, source: &Encoding, resolution: Resolution, crf: f64)
    -> Result<Encoding, AppError>;

    /// Score `distorted` against `reference` on raw decoded frames at a
    /// shared comparison resolution (the reference's native resolution when
    /// unspecified). Raw extraction failure for either side yields zeroed
    /// scores with a logged diagnostic; an error is raised only when the
    /// scoring invocation itself fails.
    fn score(
        &self,
        reference: &Encoding,
        distorted: &Encoding,
        comparison: Option<Resolution>,
        frame_limit: Option<u32>,
    ) -> Result<Scores, AppError>;
}

/// Subprocess-backed gateway around ffmpeg and ffprobe.
///
/// The only component allowed to touch the filesystem: encodes, raw frame
/// dumps and VMAF logs all land in `work_dir`, with resolution and CRF
/// embedded in every artifact name so concurrent per-resolution workers
/// never collide.
pub struct ToolGateway {
    tools: Tools,
    work_dir: PathBuf,
    control: RunControl,
}

impl ToolGateway {
    pub fn new(
        tools: Tools,
        work_dir: PathBuf,
        cancel: Arc<AtomicBool>,
        probe_timeout: Option<Duration>,
    ) -> Result<Self, AppError> {
        tools.validate()?;
        std::fs::create_dir_all(&work_dir).map_err(|e| {
            AppError::Config(format!(
                "failed to create work directory {}: {}",
                work_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            tools,
            work_dir,
            control: RunControl::new(cancel, probe_timeout),
        })
    }

    fn artifact_path(&self, source: &Path, suffix: &str, ext: &str) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        self.work_dir.join(format!("{}.{}.{}", stem, suffix, ext))
    }

    fn map_failure(failure: RunFailure, stage: &str) -> AppError {
        match failure {
            RunFailure::Cancelled => AppError::Cancelled,
            other => AppError::Encode(format!("{}: ffmpeg {}", stage, other.describe())),
        }
    }

    /// Dump raw yuv420p frames of `encoding` at the comparison resolution.
    fn to_raw(
        &self,
        encoding: &Encoding,
        comparison: Resolution,
        frame_limit: Option<u32>,
        tag: &str,
    ) -> Result<PathBuf, AppError> {
        let input = encoding
            .path
            .as_ref()
            .ok_or_else(|| AppError::Score(format!("{} encoding has no file to decode", tag)))?;

        let raw_path = self.artifact_path(input, &format!("{}.{}", tag, comparison.wxh()), "yuv");
        let output_args = command::raw_output_args(comparison, frame_limit);

        let mut cmd = command::ffmpeg_command(
            &self.tools.ffmpeg,
            input,
            &command::common_input_args(),
            &output_args,
            &raw_path,
        );

        match command::run_supervised(&mut cmd, "raw extraction", &self.control, Some(&raw_path)) {
            Ok(_) => Ok(raw_path),
            Err(RunFailure::Cancelled) => Err(AppError::Cancelled),
            Err(failure) => Err(AppError::Score(format!(
                "raw extraction of {}: ffmpeg {}",
                input.display(),
                failure.describe()
            ))),
        }
    }

    fn measure_psnr_ssim(
        &self,
        comparison: Resolution,
        ref_raw: &Path,
        dis_raw: &Path,
    ) -> Result<(f64, f64), AppError> {
        let args = command::psnr_ssim_args(comparison, ref_raw, dis_raw);
        let mut cmd = std::process::Command::new(&self.tools.ffmpeg);
        cmd.arg("-hide_banner").args(&args);

        let outcome = command::run_supervised(&mut cmd, "psnr/ssim", &self.control, None)
            .map_err(|failure| match failure {
                RunFailure::Cancelled => AppError::Cancelled,
                other => AppError::Score(format!("psnr/ssim: ffmpeg {}", other.describe())),
            })?;

        score::parse_psnr_ssim(&outcome.stderr)
    }

    fn measure_vmaf(
        &self,
        comparison: Resolution,
        ref_raw: &Path,
        dis_raw: &Path,
    ) -> Result<f64, AppError> {
        let log_path = self.artifact_path(dis_raw, "vmaf", "json");
        let args = command::vmaf_args(
            comparison,
            ref_raw,
            dis_raw,
            &log_path,
            self.tools.vmaf_threads,
        );
        let mut cmd = std::process::Command::new(&self.tools.ffmpeg);
        cmd.arg("-hide_banner").args(&args);

        command::run_supervised(&mut cmd, "vmaf", &self.control, Some(&log_path)).map_err(
            |failure| match failure {
                RunFailure::Cancelled => AppError::Cancelled,
                RunFailure::Exit { stderr, .. } if score::vmaf_unavailable(&stderr) => {
                    AppError::Score(
                        "VMAF is unavailable; ffmpeg must be built with libvmaf".to_string(),
                    )
                }
                other => AppError::Score(format!("vmaf: ffmpeg {}", other.describe())),
            },
        )?;

        let json = std::fs::read_to_string(&log_path)
            .map_err(|e| AppError::Score(format!("failed to read VMAF log: {}", e)))?;
        let _ = std::fs::remove_file(&log_path);

        score::parse_vmaf_log(&json)
    }
}

impl EncodeScore for ToolGateway {
    fn encode(
        &self,
        source: &Encoding,
        resolution: Resolution,
        crf: f64,
    ) -> Result<Encoding, AppError> {
        let input = source
            .path
            .as_ref()
            .ok_or_else(|| AppError::Config("source encoding has no file path".to_string()))?;

        let resolution = resolution.resolve(source.resolution)?;
        let output = self.artifact_path(
            input,
            &format!("{}_crf{:.3}", resolution.wxh(), crf),
            "mp4",
        );

        info!("Encoding {} at {} crf {:.3}", input.display(), resolution, crf);

        let output_args = command::x264_output_args(resolution, crf, &self.tools.x264_preset);
        let mut cmd = command::ffmpeg_command(
            &self.tools.ffmpeg,
            input,
            &command::common_input_args(),
            &output_args,
            &output,
        );

        command::run_supervised(&mut cmd, "transcode", &self.control, Some(&output))
            .map_err(|f| Self::map_failure(f, "transcode"))?;

        let info = probe::probe(&self.tools.ffprobe, &output)?;

        let mut encoding = Encoding::new(resolution, crf);
        encoding.path = Some(output);
        encoding.bitrate = info.bitrate;
        Ok(encoding)
    }

    fn score(
        &self,
        reference: &Encoding,
        distorted: &Encoding,
        comparison: Option<Resolution>,
        frame_limit: Option<u32>,
    ) -> Result<Scores, AppError> {
        let comparison = match comparison {
            Some(resolution) if resolution.pixels() > 0 => resolution,
            Some(resolution) => resolution.resolve(reference.resolution)?,
            None => reference.resolution,
        };

        // The reference dump carries the distorted encode's identity in its
        // name: concurrent per-resolution workers all extract the same
        // reference, and the gateway performs no locking.
        let ref_tag = format!(
            "ref_{}_crf{:.3}",
            distorted.resolution.wxh(),
            distorted.crf
        );
        let ref_raw = self.to_raw(reference, comparison, frame_limit, &ref_tag);
        let dis_raw = self.to_raw(distorted, comparison, frame_limit, "dis");

        let (ref_raw, dis_raw) = match (ref_raw, dis_raw) {
            (Ok(r), Ok(d)) => (r, d),
            (r, d) => {
                // One side may have dumped successfully; don't leave it behind.
                for (side, outcome) in [("reference", &r), ("distorted", &d)] {
                    match outcome {
                        Ok(raw) => {
                            let _ = std::fs::remove_file(raw);
                        }
                        Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                        Err(e) => warn!("failed to extract {} frames: {}", side, e),
                    }
                }
                return Ok(Scores::ZERO);
            }
        };

        let measured = self
            .measure_psnr_ssim(comparison, &ref_raw, &dis_raw)
            .and_then(|(psnr, ssim)| {
                let vmaf = self.measure_vmaf(comparison, &ref_raw, &dis_raw)?;
                Ok((psnr, ssim, vmaf))
            });

        let _ = std::fs::remove_file(&ref_raw);
        let _ = std::fs::remove_file(&dis_raw);

        let (psnr, ssim, vmaf) = measured?;

        info!(
            "Scored {} vs {} at {}: psnr {:.2}, ssim {:.4}, vmaf {:.2}",
            distorted
                .path
                .as_deref()
                .unwrap_or(Path::new("?"))
                .display(),
            reference
                .path
                .as_deref()
                .unwrap_or(Path::new("?"))
                .display(),
            comparison,
            psnr,
            ssim,
            vmaf
        );

        Ok(Scores { psnr, ssim, vmaf })
    }
}
