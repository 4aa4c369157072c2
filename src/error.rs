use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Bad or missing configuration, including an anchor that cannot be
    /// scored. Fatal to the whole search.
    #[error("configuration error: {0}")]
    Config(String),

    /// ffprobe failed or its output could not be parsed.
    #[error("probe failed: {0}")]
    Probe(String),

    /// The transcoder exited non-zero or could not be spawned.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The quality-scoring invocation itself failed (missing binary,
    /// non-zero exit, unparseable log). A score that merely reads as zero
    /// is not an error.
    #[error("scoring failed: {0}")]
    Score(String),

    /// The operator aborted the run; in-flight subprocesses were killed.
    #[error("cancelled")]
    Cancelled,
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        AppError::Config(format!("invalid TOML: {}", e))
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(e: toml::ser::Error) -> Self {
        AppError::Config(format!("could not serialize TOML: {}", e))
    }
}
