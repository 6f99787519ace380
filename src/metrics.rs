//! Optional per-channel counters.

/// Counters tracked on a [`crate::channel::Channel`] when
/// [`crate::config::Config::enable_metrics`] is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelMetrics {
    pub frames_written: u64,
    pub frames_read: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub writer_waits: u64,
    pub reader_overruns: u64,
}

impl ChannelMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
