use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::AppError;

/// External tool configuration, passed explicitly into the gateway at
/// construction. Lifecycle is one batch run; nothing here is process-global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    /// ffmpeg binary, used for transcoding, raw frame extraction and scoring.
    pub ffmpeg: String,
    /// ffprobe binary, used for media probing.
    pub ffprobe: String,
    /// x264 preset for search encodes.
    pub x264_preset: String,
    /// Thread count handed to libvmaf.
    pub vmaf_threads: u32,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            x264_preset: "veryslow".to_string(),
            vmaf_threads: 4,
        }
    }
}

impl Tools {
    /// Load tool configuration from the default TOML file, or fall back to
    /// defaults (writing them out for future editing) if none exists.
    pub fn load() -> Self {
        let config_path = Self::config_path();

        if config_path.exists() {
            match Self::load_from_file(&config_path) {
                Ok(tools) => {
                    info!("Loaded tool config from {}", config_path.display());
                    return tools;
                }
                Err(e) => {
                    warn!("Failed to load tool config: {}. Using defaults.", e);
                }
            }
        }

        let tools = Self::default();
        if let Err(e) = tools.save() {
            warn!("Failed to save default tool config: {}", e);
        }
        tools
    }

    /// Save tool configuration to the default TOML file.
    pub fn save(&self) -> Result<(), AppError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Config(format!("failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, toml_string)
            .map_err(|e| AppError::Config(format!("failed to write config file: {}", e)))?;

        info!("Saved tool config to {}", config_path.display());
        Ok(())
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("failed to read config file: {}", e)))?;
        let tools: Tools = toml::from_str(&content)?;
        tools.validate()?;
        Ok(tools)
    }

    /// Default configuration file path.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sizeopt")
            .join("tools.toml")
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.ffmpeg.is_empty() || self.ffprobe.is_empty() {
            return Err(AppError::Config(
                "ffmpeg and ffprobe paths must not be empty".to_string(),
            ));
        }
        if self.vmaf_threads == 0 {
            return Err(AppError::Config(
                "vmaf_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
