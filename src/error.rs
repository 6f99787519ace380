//! Error types returned from the public runtime surface.

use thiserror::Error;

/// Convenience alias for results returned from [`crate::Runtime`] operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced from the runtime's public operations.
///
/// Non-fatal, per-read-call anomalies (overrun, unexpected-unmapped-reader)
/// are reported through [`crate::channel::ReaderStatus`] on the affected
/// reader, not through this type — only hard failures of the runtime's
/// own operations land here.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("stream index {0} is out of range (valid: 0, 1)")]
    InvalidStreamIndex(usize),

    #[error("stream {0} is not configured")]
    StreamNotConfigured(usize),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("no free reader slot available on channel (max {max} readers)")]
    NoFreeReaderSlot { max: usize },

    #[error("monitor reader must be unmapped before calling map_read again")]
    MonitorAlreadyMapped,

    #[error("start requested while runtime is already running (call stop or abort first)")]
    AlreadyRunning,

    #[error("operation requires the runtime to be armed or running, but it is {0:?}")]
    InvalidState(crate::runtime::RuntimeState),

    #[error("no valid stream is configured; start requires at least one")]
    NoValidStream,

    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from loading a [`crate::config::StreamConfig`] from disk.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
