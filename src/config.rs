//! Runtime-wide and per-stream configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Maximum number of reader slots a [`crate::channel::Channel`] will ever
/// hand out (the sink's own reader plus the externally exposed monitor
/// reader both count against this).
pub const MAX_READERS: usize = 8;

/// Sizing and tuning knobs for the channels the runtime creates internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Capacity, in bytes, of each channel the runtime allocates.
    pub channel_capacity_bytes: usize,
    /// Maximum concurrently registered readers per channel.
    pub max_readers: usize,
    /// Whether to record [`crate::metrics::ChannelMetrics`] on every channel.
    pub enable_metrics: bool,
}

impl Config {
    /// Creates a new configuration with custom settings.
    ///
    /// # Panics
    ///
    /// Panics if `channel_capacity_bytes` is below 4096 bytes, or if
    /// `max_readers` is 0 or greater than [`MAX_READERS`].
    #[must_use]
    pub const fn new(channel_capacity_bytes: usize, max_readers: usize, enable_metrics: bool) -> Self {
        assert!(
            channel_capacity_bytes >= 4096,
            "channel_capacity_bytes must be at least 4096"
        );
        assert!(
            max_readers > 0 && max_readers <= MAX_READERS,
            "max_readers must be between 1 and MAX_READERS"
        );
        Self {
            channel_capacity_bytes,
            max_readers,
            enable_metrics,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024, MAX_READERS, false)
    }
}

/// Tuned for low end-to-end latency: smaller channels, metrics off.
pub const LOW_LATENCY_CONFIG: Config = Config::new(1024 * 1024, MAX_READERS, false);

/// Tuned for sustained high frame rates: large channels, metrics on.
pub const HIGH_THROUGHPUT_CONFIG: Config = Config::new(64 * 1024 * 1024, MAX_READERS, true);

/// Which kind of device (if any) a stream's camera or storage slot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    None,
    Camera,
    Storage,
}

impl Default for DeviceKind {
    fn default() -> Self {
        DeviceKind::None
    }
}

/// A device selection: what kind of device, and which one by identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub kind: DeviceKind,
    pub identifier: String,
    /// Opaque key/value settings forwarded to `Camera::set`/`Storage::set`.
    pub settings: std::collections::BTreeMap<String, String>,
}

/// Per-stream configuration: which camera and storage device to use, how
/// long to hold frames before writing them out, and how many to average.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    pub camera: DeviceSelection,
    pub storage: DeviceSelection,
    /// How long, in milliseconds, the sink withholds data younger than this
    /// from storage.
    pub write_delay_ms: f32,
    /// Total frames the source will emit before stopping on its own.
    pub max_frame_count: u64,
    /// Number of consecutive frames the filter averages; 0 or 1 disables
    /// averaging (source writes straight to the sink channel).
    pub frame_average_count: u32,
}

impl StreamConfig {
    #[must_use]
    pub fn filter_enabled(&self) -> bool {
        self.frame_average_count > 1
    }

    /// `valid` iff either a camera or a storage device is configured — a
    /// stream with neither is skipped by every lifecycle operation.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.camera.kind != DeviceKind::None || self.storage.kind != DeviceKind::None
    }

    /// Loads a [`StreamConfig`] from a TOML file on disk.
    pub fn from_toml_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let cfg = toml::from_str(&text)?;
        Ok(cfg)
    }
}

/// Writable range for a numeric configuration property, as reported by
/// [`crate::runtime::Runtime::configuration_metadata`].
///
/// `high = None` makes an unbounded upper limit explicit rather than
/// encoding it as a sentinel value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyRange {
    pub low: u64,
    pub high: Option<u64>,
    pub writable: bool,
}

/// Metadata describing which `StreamConfig` fields are writable and within
/// what ranges.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfigMetadata {
    pub max_frame_count: PropertyRange,
    pub frame_average_count: PropertyRange,
}

impl Default for StreamConfigMetadata {
    fn default() -> Self {
        Self {
            max_frame_count: PropertyRange {
                low: 0,
                high: None,
                writable: true,
            },
            frame_average_count: PropertyRange {
                low: 0,
                high: None,
                writable: true,
            },
        }
    }
}
