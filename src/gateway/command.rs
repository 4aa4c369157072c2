use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::encoding::Resolution;

/// Supervision settings shared by every subprocess the gateway launches.
#[derive(Debug, Clone)]
pub struct RunControl {
    /// Operator abort flag; checked while the child runs.
    pub cancel: Arc<AtomicBool>,
    /// Per-invocation timeout. `None` means wait indefinitely.
    pub timeout: Option<Duration>,
}

impl RunControl {
    pub fn new(cancel: Arc<AtomicBool>, timeout: Option<Duration>) -> Self {
        Self { cancel, timeout }
    }
}

/// Captured output of a finished subprocess.
#[derive(Debug)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
}

/// Why a supervised run did not produce a usable result.
#[derive(Debug)]
pub enum RunFailure {
    Spawn(String),
    Exit { code: Option<i32>, stderr: String },
    TimedOut,
    Cancelled,
}

impl RunFailure {
    /// One-line description for log and error messages.
    pub fn describe(&self) -> String {
        match self {
            RunFailure::Spawn(e) => format!("failed to spawn: {}", e),
            RunFailure::Exit { code, stderr } => {
                let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                format!(
                    "exited with status {:?}: {}",
                    code,
                    tail.into_iter().rev().collect::<Vec<_>>().join("\n")
                )
            }
            RunFailure::TimedOut => "timed out".to_string(),
            RunFailure::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Run a command to completion under cancellation and timeout supervision.
///
/// Stdout and stderr are drained on helper threads while the parent polls
/// `try_wait`, so a chatty child can never fill its pipes and stall. On
/// cancellation, timeout or non-zero exit the child is killed and `artifact`
/// (a partially-written output file) is removed; partial artifacts must
/// never be scored.
pub fn run_supervised(
    command: &mut Command,
    tool: &str,
    control: &RunControl,
    artifact: Option<&Path>,
) -> Result<RunOutcome, RunFailure> {
    debug!("subprocess = {:?}", command);

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            remove_artifact(artifact);
            RunFailure::Spawn(format!("{}: {}", tool, e))
        })?;

    let stdout_reader = child.stdout.take().map(spawn_drain);
    let stderr_reader = child.stderr.take().map(spawn_drain);
    let started = Instant::now();

    let status = loop {
        if control.cancel.load(Ordering::Relaxed) {
            info!("{} cancelled, killing subprocess", tool);
            let _ = child.kill();
            let _ = child.wait();
            remove_artifact(artifact);
            return Err(RunFailure::Cancelled);
        }

        if let Some(timeout) = control.timeout
            && started.elapsed() > timeout
        {
            info!("{} exceeded {:?}, killing subprocess", tool, timeout);
            let _ = child.kill();
            let _ = child.wait();
            remove_artifact(artifact);
            return Err(RunFailure::TimedOut);
        }

        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => thread::sleep(Duration::from_millis(100)),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                remove_artifact(artifact);
                return Err(RunFailure::Spawn(format!(
                    "failed to wait for {}: {}",
                    tool, e
                )));
            }
        }
    };

    let stdout = stdout_reader.map(join_drain).unwrap_or_default();
    let stderr = stderr_reader.map(join_drain).unwrap_or_default();

    if !status.success() {
        remove_artifact(artifact);
        return Err(RunFailure::Exit {
            code: status.code(),
            stderr,
        });
    }

    Ok(RunOutcome { stdout, stderr })
}

fn spawn_drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        let _ = pipe.read_to_string(&mut buffer);
        buffer
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

fn remove_artifact(artifact: Option<&Path>) {
    if let Some(path) = artifact {
        let _ = std::fs::remove_file(path);
    }
}

/// Assemble a full ffmpeg invocation from opaque input/output token lists:
/// `ffmpeg -hide_banner {input_args} -i {input} {output_args} {output}`.
pub fn ffmpeg_command(
    ffmpeg: &str,
    input: &Path,
    input_args: &[String],
    output_args: &[String],
    output: &Path,
) -> Command {
    let mut command = Command::new(ffmpeg);
    command.arg("-hide_banner");
    command.args(input_args);
    command.arg("-i");
    command.arg(input);
    command.args(output_args);
    command.arg(output);
    command
}

/// Input-side arguments common to all gateway invocations.
pub fn common_input_args() -> Vec<String> {
    vec!["-y".to_string(), "-threads".to_string(), "0".to_string()]
}

/// Output-side arguments for an x264 search encode at a resolved resolution
/// and CRF. The template holds the encoding parameters fixed so that the CRF
/// is the only quality variable the search moves.
pub fn x264_output_args(resolution: Resolution, crf: f64, preset: &str) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        resolution.wxh(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        preset.to_string(),
        "-crf".to_string(),
        format!("{:.3}", crf),
        "-x264opts".to_string(),
        "psy=0:ref=5:keyint=90:min-keyint=9:chroma_qp_offset=0:aq_mode=2".to_string(),
        "-maxrate".to_string(),
        "2500k".to_string(),
        "-bufsize".to_string(),
        "5M".to_string(),
    ];

    // Audio is carried along so measured bitrates reflect a deliverable file.
    args.extend(
        [
            "-async", "1", "-c:a", "aac", "-b:a", "48k", "-ar", "44100", "-ac", "2",
        ]
        .map(str::to_string),
    );
    args.extend(["-movflags".to_string(), "faststart".to_string()]);
    args
}

/// Output-side arguments for a raw yuv420p frame dump at the comparison
/// resolution, optionally limited to the first `frame_limit` frames.
pub fn raw_output_args(resolution: Resolution, frame_limit: Option<u32>) -> Vec<String> {
    let mut args = vec!["-an".to_string(), "-s".to_string(), resolution.wxh()];
    if let Some(frames) = frame_limit {
        args.push("-vframes".to_string());
        args.push(frames.to_string());
    }
    args.extend(
        ["-pix_fmt", "yuv420p", "-f", "rawvideo"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

/// Arguments for the PSNR+SSIM comparison of two raw dumps. The command
/// produces no file; scores are parsed from its stderr.
pub fn psnr_ssim_args(resolution: Resolution, ref_raw: &Path, dis_raw: &Path) -> Vec<String> {
    let raw_input = |path: &Path| {
        vec![
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-s".to_string(),
            resolution.wxh(),
            "-i".to_string(),
            path.to_string_lossy().to_string(),
        ]
    };

    let mut args = raw_input(ref_raw);
    args.extend(raw_input(dis_raw));
    args.extend(
        ["-lavfi", "psnr;[0:v][1:v]ssim", "-f", "null", "-"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

/// Arguments for the VMAF comparison of two raw dumps, writing the libvmaf
/// JSON log to `log_path`.
pub fn vmaf_args(
    resolution: Resolution,
    ref_raw: &Path,
    dis_raw: &Path,
    log_path: &Path,
    threads: u32,
) -> Vec<String> {
    let raw_input = |path: &Path| {
        vec![
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-s".to_string(),
            resolution.wxh(),
            "-i".to_string(),
            path.to_string_lossy().to_string(),
        ]
    };

    // libvmaf expects distorted first, reference second.
    let mut args = raw_input(dis_raw);
    args.extend(raw_input(ref_raw));
    args.push("-lavfi".to_string());
    args.push(format!(
        "libvmaf=log_path={}:log_fmt=json:n_threads={}",
        log_path.to_string_lossy(),
        threads
    ));
    args.extend(["-f", "null", "-"].iter().map(|s| s.to_string()));
    args
}
