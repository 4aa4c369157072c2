use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::probe::MediaInfo;

/// A target video resolution.
///
/// Either an exact width/height pair, or only the shorter edge (e.g. "720p"),
/// which resolves to an exact pair once the source's aspect ratio is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Exact { width: u32, height: u32 },
    ShorterEdge(u32),
}

impl Resolution {
    /// Parse "1280x720", "1280:720" or "720p".
    pub fn parse(s: &str) -> Result<Self, AppError> {
        let s = s.trim();

        if let Some(edge) = s.strip_suffix(['p', 'P']) {
            let edge: u32 = edge
                .parse()
                .map_err(|_| AppError::Config(format!("'{}' is not a valid resolution", s)))?;
            if edge == 0 {
                return Err(AppError::Config(format!("'{}' has a zero edge", s)));
            }
            return Ok(Resolution::ShorterEdge(edge));
        }

        if let Some((w, h)) = s.split_once(['x', ':']) {
            let width: u32 = w
                .parse()
                .map_err(|_| AppError::Config(format!("'{}' is not a valid resolution", s)))?;
            let height: u32 = h
                .parse()
                .map_err(|_| AppError::Config(format!("'{}' is not a valid resolution", s)))?;
            if width == 0 || height == 0 {
                return Err(AppError::Config(format!("'{}' has a zero dimension", s)));
            }
            return Ok(Resolution::Exact { width, height });
        }

        Err(AppError::Config(format!(
            "'{}' is not a valid resolution (expected WxH or Np)",
            s
        )))
    }

    /// Pixel area. Zero for a still-unresolved shorter-edge value; area is
    /// the basis for size ordering between resolved resolutions.
    pub fn pixels(self) -> u64 {
        match self {
            Resolution::Exact { width, height } => u64::from(width) * u64::from(height),
            Resolution::ShorterEdge(_) => 0,
        }
    }

    /// Resolve a shorter-edge value against the source resolution,
    /// preserving aspect ratio. Both sides are truncated to multiples of 4
    /// for encoder macroblock alignment. Exact values pass through as-is.
    pub fn resolve(self, source: Resolution) -> Result<Self, AppError> {
        let edge = match self {
            Resolution::Exact { .. } => return Ok(self),
            Resolution::ShorterEdge(edge) => edge,
        };

        let Resolution::Exact {
            width: src_w,
            height: src_h,
        } = source
        else {
            return Err(AppError::Config(
                "cannot resolve a shorter-edge resolution against an unresolved source".to_string(),
            ));
        };

        let (mut width, mut height) = if src_w < src_h {
            // Portrait: the shorter edge is the width.
            let width = edge;
            let height = (u64::from(src_h) * u64::from(width) / u64::from(src_w)) as u32;
            (width, height)
        } else {
            let height = edge;
            let width = (u64::from(src_w) * u64::from(height) / u64::from(src_h)) as u32;
            (width, height)
        };

        width = width / 4 * 4;
        height = height / 4 * 4;

        if width == 0 || height == 0 {
            return Err(AppError::Config(format!(
                "resolving {} against {} yields a degenerate size",
                self, source
            )));
        }

        Ok(Resolution::Exact { width, height })
    }

    /// "WxH" string for ffmpeg `-s` arguments. Only valid once resolved.
    pub fn wxh(&self) -> String {
        match self {
            Resolution::Exact { width, height } => format!("{}x{}", width, height),
            Resolution::ShorterEdge(edge) => format!("{}p", edge),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wxh())
    }
}

/// Quality scores from one comparison run. Zero means "not measured" or
/// "measurement unavailable".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub psnr: f64,
    pub ssim: f64,
    pub vmaf: f64,
}

impl Scores {
    pub const ZERO: Scores = Scores {
        psnr: 0.0,
        ssim: 0.0,
        vmaf: 0.0,
    };
}

/// One concrete encode: where it lives, how it was made and how it measures.
///
/// Bitrate and scores start at zero and are filled in as the encode and the
/// quality measurement complete. Each search probe owns its own instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encoding {
    /// Path of the encoded file, if it exists yet.
    pub path: Option<PathBuf>,
    pub resolution: Resolution,
    /// Quality knob; lower means higher quality and higher bitrate.
    pub crf: f64,
    /// Bits per second as reported by the prober; 0 until measured.
    pub bitrate: u64,
    pub psnr: f64,
    pub ssim: f64,
    pub vmaf: f64,
}

impl Encoding {
    pub fn new(resolution: Resolution, crf: f64) -> Self {
        Self {
            path: None,
            resolution,
            crf,
            bitrate: 0,
            psnr: 0.0,
            ssim: 0.0,
            vmaf: 0.0,
        }
    }

    /// Describe an already-existing file from its probed media info.
    pub fn from_media(info: &MediaInfo) -> Self {
        Self {
            path: Some(info.path.clone()),
            resolution: info.resolution,
            crf: 0.0,
            bitrate: info.bitrate,
            psnr: 0.0,
            ssim: 0.0,
            vmaf: 0.0,
        }
    }

    /// Whether a usable perceptual score is present.
    pub fn is_scored(&self) -> bool {
        self.vmaf != 0.0
    }

    pub fn apply_scores(&mut self, scores: Scores) {
        self.psnr = scores.psnr;
        self.ssim = scores.ssim;
        self.vmaf = scores.vmaf;
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} crf {:.2}: {} bps, psnr {:.2}, ssim {:.4}, vmaf {:.2}",
            self.resolution, self.crf, self.bitrate, self.psnr, self.ssim, self.vmaf
        )
    }
}
