//! Per-stream wiring: one source, one optional filter, one sink, and the
//! externally exposed monitor reader, linked by channels.
//!
//! Stage-to-stage signalling (the filter's shape-reset barrier, "stop
//! upstream/downstream") is implemented as direct method calls on small
//! handle types rather than injected function pointers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::channel::{Channel, ChannelReader};
use crate::config::Config;
use crate::device::{Camera, Storage};
use crate::error::{Result, RuntimeError};
use crate::filter::run_filter;
use crate::frame::{runtime_clock, ImageShape};
use crate::sink::run_sink;
use crate::source::run_source;

/// The most recent image shape the source observed, shared so the runtime
/// can answer `get_shape` without holding a live camera handle itself.
pub type SharedShape = Arc<Mutex<Option<ImageShape>>>;

/// A camera handle shared between the source thread and the runtime, so a
/// manual trigger can reach the running camera without the source giving
/// up exclusive ownership of it.
pub type SharedCamera = Arc<Mutex<Box<dyn Camera>>>;

/// Plain atomic start/stop flags, one writer-many-readers, no lock needed.
#[derive(Default)]
pub struct StageFlags {
    stopping: AtomicBool,
    running: AtomicBool,
}

impl StageFlags {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_stopping(&self, v: bool) {
        self.stopping.store(v, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, v: bool) {
        self.running.store(v, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub type SharedFlags = Arc<StageFlags>;

/// Synchronous barrier the source uses to tell the filter "drop your
/// in-progress accumulator" and wait for acknowledgement.
#[derive(Default)]
pub struct FilterResetSync {
    requested: AtomicBool,
    generation: Mutex<u64>,
    acked: Condvar,
}

impl FilterResetSync {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called by the source: request a reset and block until the filter
    /// acknowledges it has dropped any accumulator.
    pub fn request_and_wait(&self) {
        let start = *self.generation.lock().unwrap();
        self.requested.store(true, Ordering::SeqCst);
        let mut gen = self.generation.lock().unwrap();
        while *gen == start {
            gen = self.acked.wait(gen).unwrap();
        }
    }

    /// Called by the filter each tick: returns and clears whether a reset
    /// was requested since the last check.
    pub fn take_requested(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    /// Called by the filter after it has dropped its accumulator.
    pub fn acknowledge(&self) {
        let mut gen = self.generation.lock().unwrap();
        *gen = gen.wrapping_add(1);
        self.acked.notify_all();
    }
}

/// One stream's source → optional filter → sink pipeline, plus the
/// monitor reader exposed through the runtime's public API.
pub struct StreamPipeline {
    pub stream_id: u8,
    sink_channel: Arc<Channel>,
    filter_channel: Option<Arc<Channel>>,
    source_flags: SharedFlags,
    filter_flags: Option<SharedFlags>,
    sink_flags: SharedFlags,
    reset_sync: Option<Arc<FilterResetSync>>,
    source_thread: Option<JoinHandle<()>>,
    filter_thread: Option<JoinHandle<()>>,
    sink_thread: Option<JoinHandle<()>>,
    monitor_reader: ChannelReader,
    last_shape: SharedShape,
    camera: Option<SharedCamera>,
}

impl StreamPipeline {
    #[must_use]
    pub fn new(stream_id: u8, config: &Config, filter_enabled: bool) -> Self {
        let sink_channel = Arc::new(Channel::new(config.channel_capacity_bytes, config.max_readers));
        let filter_channel = filter_enabled
            .then(|| Arc::new(Channel::new(config.channel_capacity_bytes, config.max_readers)));
        Self {
            stream_id,
            sink_channel,
            filter_channel,
            source_flags: StageFlags::new(),
            filter_flags: filter_enabled.then(StageFlags::new),
            sink_flags: StageFlags::new(),
            reset_sync: filter_enabled.then(FilterResetSync::new),
            source_thread: None,
            filter_thread: None,
            sink_thread: None,
            monitor_reader: ChannelReader::new(),
            last_shape: Arc::new(Mutex::new(None)),
            camera: None,
        }
    }

    /// The most recently observed camera image shape, if the source has
    /// queried one yet.
    #[must_use]
    pub fn last_shape(&self) -> Option<ImageShape> {
        *self.last_shape.lock().unwrap()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.source_flags.is_running()
            || self.filter_flags.as_ref().is_some_and(|f| f.is_running())
            || self.sink_flags.is_running()
    }

    #[must_use]
    pub fn sink_channel(&self) -> &Arc<Channel> {
        &self.sink_channel
    }

    pub fn monitor_reader_mut(&mut self) -> &mut ChannelReader {
        &mut self.monitor_reader
    }

    /// Borrows the sink channel and the monitor reader simultaneously,
    /// since they're read together on every map/unmap call and a `&Channel`
    /// plus a `&mut ChannelReader` pulled from two separate accessor calls
    /// can't both be held live against one `&mut self`.
    pub fn channel_and_monitor(&mut self) -> (&Channel, &mut ChannelReader) {
        (self.sink_channel.as_ref(), &mut self.monitor_reader)
    }

    #[must_use]
    pub fn bytes_waiting(&self) -> usize {
        // The sink stage's own reader is a distinct registration from the
        // monitor's; bytes waiting to be written refers to the sink's
        // reader, which this pipeline doesn't expose directly, so we
        // approximate via the channel's own head/high bookkeeping through
        // the monitor — callers needing the sink-specific figure should
        // prefer `Runtime::bytes_waiting_to_be_written_to_disk`.
        self.sink_channel.bytes_waiting(&self.monitor_reader)
    }

    /// Brings `storage` and `camera` up and spawns the source/filter/sink
    /// threads for this stream.
    ///
    /// Mirrors the original runtime's `acquire_start` device sequencing:
    /// the storage device is started and has the camera's image shape
    /// reserved against it before the camera itself is started, so storage
    /// never sees frames it hasn't been told to expect.
    pub fn start(
        &mut self,
        mut camera: Box<dyn Camera>,
        mut storage: Box<dyn Storage>,
        max_frame_count: u64,
        frame_average_count: u32,
        write_delay_ms: f32,
    ) -> Result<()> {
        storage.start().map_err(RuntimeError::Storage)?;

        let shape = match camera.get_image_shape() {
            Ok(shape) => shape,
            Err(e) => {
                let _ = storage.stop();
                return Err(RuntimeError::Camera(e));
            }
        };
        if let Err(e) = storage.reserve_image_shape(&shape) {
            let _ = storage.stop();
            return Err(RuntimeError::Storage(e));
        }
        if let Err(e) = camera.start() {
            let _ = storage.stop();
            return Err(RuntimeError::Camera(e));
        }
        *self.last_shape.lock().unwrap() = Some(shape);

        self.source_flags.set_stopping(false);
        self.source_flags.set_running(true);
        self.sink_flags.set_stopping(false);
        self.sink_flags.set_running(true);
        if let Some(f) = &self.filter_flags {
            f.set_stopping(false);
            f.set_running(true);
        }

        let epoch = runtime_clock();

        let sink_channel = Arc::clone(&self.sink_channel);
        let sink_flags = Arc::clone(&self.sink_flags);
        let source_flags_for_sink = Arc::clone(&self.source_flags);
        self.sink_thread = Some(std::thread::spawn(move || {
            run_sink(
                sink_channel,
                sink_flags,
                source_flags_for_sink,
                storage,
                write_delay_ms,
                epoch,
            );
        }));

        if let (Some(filter_channel), Some(filter_flags), Some(reset_sync)) =
            (&self.filter_channel, &self.filter_flags, &self.reset_sync)
        {
            let filter_channel = Arc::clone(filter_channel);
            let sink_channel = Arc::clone(&self.sink_channel);
            let filter_flags = Arc::clone(filter_flags);
            let reset_sync = Arc::clone(reset_sync);
            let k = frame_average_count.max(1);
            self.filter_thread = Some(std::thread::spawn(move || {
                run_filter(filter_channel, sink_channel, filter_flags, reset_sync, k);
            }));
        }

        let shared_camera: SharedCamera = Arc::new(Mutex::new(camera));
        self.camera = Some(Arc::clone(&shared_camera));

        let source_flags = Arc::clone(&self.source_flags);
        let filter_flags_for_source = self.filter_flags.clone();
        let sink_flags_for_source = Arc::clone(&self.sink_flags);
        let reset_sync_for_source = self.reset_sync.clone();
        let target_channel = self
            .filter_channel
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.sink_channel));
        let last_shape = Arc::clone(&self.last_shape);
        self.source_thread = Some(std::thread::spawn(move || {
            run_source(
                shared_camera,
                source_flags,
                target_channel,
                filter_flags_for_source,
                sink_flags_for_source,
                reset_sync_for_source,
                max_frame_count,
                epoch,
                last_shape,
            );
        }));

        Ok(())
    }

    /// Forwards a manual trigger request to the running camera.
    pub fn execute_trigger(&self) -> Result<()> {
        match &self.camera {
            Some(camera) => camera
                .lock()
                .unwrap()
                .execute_trigger()
                .map_err(RuntimeError::Camera),
            None => Err(RuntimeError::Camera("no camera open for this stream".to_string())),
        }
    }

    /// Signals all stages to stop, joins their threads, then flushes
    /// whatever the monitor reader hasn't consumed yet.
    ///
    /// The flush is bounded to two map/unmap rounds: the first drains
    /// whatever was pending when the stages stopped, and the second always
    /// maps zero new bytes since nothing is being written anymore.
    pub fn stop(&mut self) {
        self.source_flags.set_stopping(true);
        if let Some(f) = &self.filter_flags {
            f.set_stopping(true);
        }
        self.sink_flags.set_stopping(true);
        if let Some(h) = self.source_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.filter_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.sink_thread.take() {
            let _ = h.join();
        }
        self.sink_channel.accept_writes(true);

        let (channel, monitor) = self.channel_and_monitor();
        for _ in 0..2 {
            let nbytes = match channel.read_map(monitor) {
                Ok(slice) => slice.len(),
                Err(_) => break,
            };
            channel.read_unmap(monitor, nbytes);
            if nbytes == 0 {
                break;
            }
        }
    }

    /// `abort`: close the sink channel to further writes before stopping,
    /// so a blocked writer wakes immediately instead of waiting for space.
    pub fn abort(&mut self) {
        self.source_flags.set_stopping(true);
        self.sink_channel.accept_writes(false);
        if let Some(fc) = &self.filter_channel {
            fc.accept_writes(false);
        }
        self.stop();
    }
}
