//! The public acquisition runtime: owns both streams' pipelines and device
//! manager, and drives the `AwaitingConfiguration -> Armed -> Running`
//! lifecycle.

use log::info;

use crate::channel::ReaderStatus;
use crate::config::{Config, StreamConfig, StreamConfigMetadata};
use crate::device::mock::MockDeviceManager;
use crate::device::{Camera, DeviceManager, Storage};
use crate::error::{Result, RuntimeError};
use crate::frame::ImageShape;
use crate::pipeline::StreamPipeline;

/// Number of independently configurable video streams.
pub const N_STREAMS: usize = 2;

/// Coarse lifecycle state of the runtime as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// No stream has been configured yet.
    AwaitingConfiguration,
    /// At least one stream is configured, but `start` hasn't been called
    /// (or a previous run has been `stop`ped).
    Armed,
    /// `start` has been called and at least one stream's pipeline is live.
    Running,
    /// The runtime has been torn down and must not be used again.
    Closed,
}

struct StreamSlot {
    config: Option<StreamConfig>,
    pipeline: Option<StreamPipeline>,
}

impl StreamSlot {
    fn empty() -> Self {
        Self {
            config: None,
            pipeline: None,
        }
    }
}

/// Owns both streams' pipelines, the device manager, and the runtime-wide
/// lifecycle state. Construction brings the runtime to life; `Drop` tears
/// it down.
pub struct Runtime {
    config: Config,
    streams: Vec<StreamSlot>,
    device_manager: Box<dyn DeviceManager>,
    state: RuntimeState,
}

impl Runtime {
    /// Creates a runtime with the default mock device manager.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_device_manager(config, Box::new(MockDeviceManager::new()))
    }

    /// Creates a runtime against a caller-supplied device manager (real
    /// hardware drivers are out of scope; tests and embedders may still
    /// substitute their own [`DeviceManager`] implementation).
    #[must_use]
    pub fn with_device_manager(config: Config, device_manager: Box<dyn DeviceManager>) -> Self {
        info!("runtime: initialized with {} device(s) available", device_manager.count());
        Self {
            config,
            streams: (0..N_STREAMS).map(|_| StreamSlot::empty()).collect(),
            device_manager,
            state: RuntimeState::AwaitingConfiguration,
        }
    }

    #[must_use]
    pub fn get_state(&self) -> RuntimeState {
        self.state
    }

    #[must_use]
    pub fn device_manager(&self) -> &dyn DeviceManager {
        self.device_manager.as_ref()
    }

    fn check_stream_index(&self, stream: usize) -> Result<()> {
        if stream >= N_STREAMS {
            return Err(RuntimeError::InvalidStreamIndex(stream));
        }
        Ok(())
    }

    /// Stores `config` for `stream`, without touching any running pipeline.
    /// Advances `AwaitingConfiguration -> Armed` the first time a valid
    /// configuration is stored.
    pub fn configure(&mut self, stream: usize, config: StreamConfig) -> Result<()> {
        self.check_stream_index(stream)?;
        if self.state == RuntimeState::Running {
            return Err(RuntimeError::AlreadyRunning);
        }
        let valid = config.is_valid();
        self.streams[stream].config = Some(config);
        if valid && self.state == RuntimeState::AwaitingConfiguration {
            self.state = RuntimeState::Armed;
        }
        Ok(())
    }

    #[must_use]
    pub fn get_configuration(&self, stream: usize) -> Option<&StreamConfig> {
        self.streams.get(stream).and_then(|s| s.config.as_ref())
    }

    /// Writable-range metadata for the per-stream numeric properties,
    /// constant across every stream (`acquire_get_configuration_metadata`).
    #[must_use]
    pub fn configuration_metadata(&self) -> StreamConfigMetadata {
        StreamConfigMetadata::default()
    }

    /// Image shape the running source most recently observed for `stream`,
    /// if a pipeline is live and has queried its camera at least once.
    pub fn get_shape(&self, stream: usize) -> Result<Option<ImageShape>> {
        self.check_stream_index(stream)?;
        if self.streams[stream].config.is_none() {
            return Err(RuntimeError::StreamNotConfigured(stream));
        }
        Ok(self.streams[stream]
            .pipeline
            .as_ref()
            .and_then(StreamPipeline::last_shape))
    }

    /// Starts every validly configured stream's pipeline, given the already
    /// opened camera/storage devices for each (device opening itself is the
    /// embedder's responsibility, since `DeviceManager` only enumerates
    /// identifiers per spec; mock-backed tests construct devices directly).
    pub fn start(&mut self, devices: Vec<Option<(Box<dyn Camera>, Box<dyn Storage>)>>) -> Result<()> {
        if self.state == RuntimeState::Closed {
            return Err(RuntimeError::InvalidState(self.state));
        }
        if self.state == RuntimeState::Running {
            return Err(RuntimeError::AlreadyRunning);
        }
        if self.state != RuntimeState::Armed {
            return Err(RuntimeError::InvalidState(self.state));
        }

        let mut started_any = false;
        for (idx, maybe_devices) in devices.into_iter().enumerate() {
            if idx >= N_STREAMS {
                break;
            }
            let Some(config) = self.streams[idx].config.clone() else {
                continue;
            };
            if !config.is_valid() {
                continue;
            }
            let Some((camera, storage)) = maybe_devices else {
                continue;
            };

            let mut pipeline =
                StreamPipeline::new(idx as u8, &self.config, config.filter_enabled());
            if let Err(e) = pipeline.start(
                camera,
                storage,
                config.max_frame_count,
                config.frame_average_count.max(1),
                config.write_delay_ms,
            ) {
                self.streams[idx].pipeline = None;
                self.stop();
                return Err(e);
            }
            self.streams[idx].pipeline = Some(pipeline);
            started_any = true;
        }

        if !started_any {
            return Err(RuntimeError::NoValidStream);
        }

        self.state = RuntimeState::Running;
        Ok(())
    }

    /// Signals every running stream to stop, joins their threads, then
    /// flushes each stream's monitor reader so it doesn't hold stale data
    /// into the next run. The monitor stays addressable via `map_read`
    /// afterward; the sink stage's own final flush, not the monitor's, is
    /// what guarantees every frame reaches storage.
    pub fn stop(&mut self) {
        for slot in &mut self.streams {
            if let Some(pipeline) = &mut slot.pipeline {
                pipeline.stop();
            }
        }
        if self.state == RuntimeState::Running {
            self.state = RuntimeState::Armed;
        }
    }

    /// Stops the source immediately and closes both channels to further
    /// writes, so a writer blocked on back-pressure wakes immediately
    /// instead of waiting for reader drain, then performs a normal `stop`.
    pub fn abort(&mut self) {
        for slot in &mut self.streams {
            if let Some(pipeline) = &mut slot.pipeline {
                pipeline.abort();
            }
        }
        self.stop();
    }

    /// Forwards a manual trigger request to `stream`'s running camera.
    pub fn execute_trigger(&self, stream: usize) -> Result<()> {
        self.check_stream_index(stream)?;
        let Some(pipeline) = &self.streams[stream].pipeline else {
            return Err(RuntimeError::InvalidState(self.state));
        };
        pipeline.execute_trigger()
    }

    /// Maps the next available slice from `stream`'s monitor reader.
    pub fn map_read(&mut self, stream: usize) -> Result<&[u8]> {
        self.check_stream_index(stream)?;
        let Some(pipeline) = &mut self.streams[stream].pipeline else {
            return Err(RuntimeError::StreamNotConfigured(stream));
        };
        let (channel, reader) = pipeline.channel_and_monitor();
        match channel.reader_status(reader) {
            ReaderStatus::Ok | ReaderStatus::Error => {}
            ReaderStatus::ExpectedUnmapped => return Err(RuntimeError::MonitorAlreadyMapped),
        }
        channel
            .read_map(reader)
            .map_err(|e| RuntimeError::NoFreeReaderSlot { max: e.max })
    }

    /// Unmaps `stream`'s monitor reader, consuming up to `consumed_bytes`.
    pub fn unmap_read(&mut self, stream: usize, consumed_bytes: usize) -> Result<()> {
        self.check_stream_index(stream)?;
        let Some(pipeline) = &mut self.streams[stream].pipeline else {
            return Err(RuntimeError::StreamNotConfigured(stream));
        };
        let (channel, reader) = pipeline.channel_and_monitor();
        channel.read_unmap(reader, consumed_bytes);
        Ok(())
    }

    /// Bytes queued in `stream`'s sink channel, not yet written to storage.
    #[must_use]
    pub fn bytes_waiting_to_be_written_to_disk(&self, stream: usize) -> u64 {
        self.streams
            .get(stream)
            .and_then(|s| s.pipeline.as_ref())
            .map(|p| p.bytes_waiting() as u64)
            .unwrap_or(0)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
        self.state = RuntimeState::Closed;
    }
}
