//! Sink stage: writes frames from the sink channel to storage once they're
//! old enough, per `write_delay_ms`.
//!
//! The split between "old enough to write" and "too young" is a linear walk
//! over the mapped slice's frame records, comparing each frame's
//! `timestamp_acq_thread` against `now - write_delay_ms` on the same
//! monotonic clock the source stamped it with (see
//! [`crate::frame::runtime_clock`]).

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::channel::{Channel, ChannelReader};
use crate::device::{DeviceState, Storage};
use crate::frame::{elapsed_nanos, FrameHeader, FrameIterator};
use crate::pipeline::SharedFlags;
use crate::throttler::Throttler;

/// Splits `slice` into the byte length of its writable prefix (frames old
/// enough per `threshold_nanos`) and whether at least one too-young frame
/// was seen (meaning the walk can stop there; everything after is younger
/// still, since frames are emitted in acquisition order).
fn writable_prefix_len(slice: &[u8], threshold_nanos: u64) -> usize {
    let mut offset = 0usize;
    for record in FrameIterator::new(slice) {
        let header_len = FrameHeader::header_bytes();
        // SAFETY: `record` is a complete frame record written by the
        // source or filter stage, at least `header_len` bytes long.
        let header = unsafe { std::ptr::read_unaligned(record.as_ptr().cast::<FrameHeader>()) };
        if header.timestamp_acq_thread > threshold_nanos {
            break;
        }
        offset += record.len();
    }
    offset
}

/// Runs the sink thread loop: flushes writable frames to `storage` every
/// tick, throttled to roughly one tick per 10ms.
///
/// `epoch` is the same monotonic origin the source stamped
/// `timestamp_acq_thread` against.
pub fn run_sink(
    sink_channel: Arc<Channel>,
    flags: SharedFlags,
    source_flags: SharedFlags,
    mut storage: Box<dyn Storage>,
    write_delay_ms: f32,
    epoch: Instant,
) {
    let mut reader = ChannelReader::new();
    let mut throttler = Throttler::new(Duration::from_millis(10));
    let delay_nanos = (write_delay_ms.max(0.0) as f64 * 1_000_000.0) as u64;

    let mut failed = false;

    while !flags.is_stopping() && storage.get_state() == DeviceState::Running {
        match flush_once(&sink_channel, &mut reader, storage.as_mut(), epoch, delay_nanos) {
            FlushOutcome::Progressed | FlushOutcome::NothingWritable => {}
            FlushOutcome::StorageFailed => {
                source_flags.set_stopping(true);
                failed = true;
                break;
            }
        }
        throttler.wait();
    }

    if !failed {
        // Final drain: keep flushing until nothing old enough remains,
        // then once more unconditionally so any pending end-of-run data
        // (new enough to have still been "too young" moments ago) is
        // captured too — every frame must reach storage before this stage exits.
        loop {
            match flush_once(&sink_channel, &mut reader, storage.as_mut(), epoch, delay_nanos) {
                FlushOutcome::Progressed => {}
                FlushOutcome::NothingWritable => break,
                FlushOutcome::StorageFailed => {
                    source_flags.set_stopping(true);
                    break;
                }
            }
        }
        flush_all(&sink_channel, &mut reader, storage.as_mut());
    }

    if let Err(e) = storage.stop() {
        warn!("sink: storage stop failed: {e}");
    }
    flags.set_running(false);
}

/// Outcome of one [`flush_once`] call.
enum FlushOutcome {
    /// At least one frame was appended to storage.
    Progressed,
    /// Nothing was mapped, or what was mapped wasn't old enough yet.
    NothingWritable,
    /// `storage.append` returned an error; the run is no longer viable.
    StorageFailed,
}

/// Maps the sink channel once, appends its writable prefix to storage, and
/// unmaps exactly that many bytes.
fn flush_once(
    sink_channel: &Channel,
    reader: &mut ChannelReader,
    storage: &mut dyn Storage,
    epoch: Instant,
    delay_nanos: u64,
) -> FlushOutcome {
    let slice = match sink_channel.read_map(reader) {
        Ok(s) => s,
        Err(_) => return FlushOutcome::NothingWritable,
    };
    if slice.is_empty() {
        sink_channel.read_unmap(reader, 0);
        return FlushOutcome::NothingWritable;
    }

    let now_nanos = elapsed_nanos(epoch, crate::frame::runtime_clock());
    let threshold = now_nanos.saturating_sub(delay_nanos);
    let writable = writable_prefix_len(slice, threshold);

    if writable == 0 {
        sink_channel.read_unmap(reader, 0);
        return FlushOutcome::NothingWritable;
    }

    if let Err(e) = storage.append(&slice[..writable]) {
        error!("sink: storage append failed: {e}");
        sink_channel.read_unmap(reader, 0);
        return FlushOutcome::StorageFailed;
    }

    sink_channel.read_unmap(reader, writable);
    FlushOutcome::Progressed
}

/// Unconditionally drains the channel to storage regardless of age, for
/// the final flush on stop.
fn flush_all(sink_channel: &Channel, reader: &mut ChannelReader, storage: &mut dyn Storage) {
    loop {
        let slice = match sink_channel.read_map(reader) {
            Ok(s) => s,
            Err(_) => return,
        };
        if slice.is_empty() {
            sink_channel.read_unmap(reader, 0);
            return;
        }
        if let Err(e) = storage.append(slice) {
            error!("sink: storage append failed during final flush: {e}");
            sink_channel.read_unmap(reader, 0);
            return;
        }
        let len = slice.len();
        sink_channel.read_unmap(reader, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MemoryStorage, TrashStorage};
    use crate::frame::{runtime_clock, ImageShape, SampleType};
    use crate::pipeline::StageFlags;

    fn write_frame(ch: &Channel, ts_nanos: u64) {
        let shape = ImageShape::new(2, 2, 1, SampleType::U8);
        let nbytes = FrameHeader::header_bytes() + shape.payload_bytes();
        let mut r = ch.write_map(nbytes).unwrap();
        let region = r.as_mut_slice();
        let (hdr, payload) = region.split_at_mut(FrameHeader::header_bytes());
        let header = FrameHeader {
            bytes_of_frame: nbytes as u64,
            frame_id: 0,
            hardware_frame_id: 0,
            timestamp_hardware: 0,
            timestamp_acq_thread: ts_nanos,
            shape,
        };
        unsafe {
            std::ptr::write_unaligned(hdr.as_mut_ptr().cast::<FrameHeader>(), header);
        }
        payload.fill(7);
        r.commit();
    }

    #[test]
    fn withholds_frames_younger_than_delay() {
        let channel = Channel::new(1024 * 1024, 8);
        let epoch = runtime_clock();
        write_frame(&channel, 0);
        write_frame(&channel, 50_000_000_000);

        let mut reader = ChannelReader::new();
        let mut storage = TrashStorage::new();
        flush_once(&channel, &mut reader, &mut storage, epoch, 1_000_000_000);

        let shape = ImageShape::new(2, 2, 1, SampleType::U8);
        let one_frame_bytes = FrameHeader::header_bytes() as u64 + shape.payload_bytes() as u64;
        assert_eq!(storage.bytes_appended(), one_frame_bytes);
    }

    /// A storage device whose `append` always fails, to exercise the sink's
    /// error-propagation path.
    #[derive(Default)]
    struct FailingStorage {
        state: crate::device::DeviceState,
    }

    impl Storage for FailingStorage {
        fn identifier(&self) -> &str {
            "failing"
        }
        fn set(&mut self, _key: &str, _value: &str) -> Result<(), String> {
            Ok(())
        }
        fn get(&self, _key: &str) -> Option<String> {
            None
        }
        fn reserve_image_shape(&mut self, _shape: &ImageShape) -> Result<(), String> {
            Ok(())
        }
        fn get_state(&self) -> crate::device::DeviceState {
            self.state
        }
        fn start(&mut self) -> Result<(), String> {
            self.state = crate::device::DeviceState::Running;
            Ok(())
        }
        fn stop(&mut self) -> Result<(), String> {
            self.state = crate::device::DeviceState::Armed;
            Ok(())
        }
        fn append(&mut self, _data: &[u8]) -> Result<(), String> {
            Err("disk full".to_string())
        }
    }

    #[test]
    fn storage_append_failure_signals_the_source_to_stop() {
        let channel = Arc::new(Channel::new(1024 * 1024, 8));
        write_frame(&channel, 0);

        let flags = StageFlags::new();
        let source_flags = StageFlags::new();
        // Never separately requests stopping; `run_sink` must do it once
        // the storage append fails.
        let mut storage = Box::new(FailingStorage::default());
        storage.start().unwrap();
        run_sink(Arc::clone(&channel), Arc::clone(&flags), Arc::clone(&source_flags), storage, 0.0, runtime_clock());

        assert!(source_flags.is_stopping(), "source should be told to stop after a storage failure");
    }

    #[test]
    fn run_sink_flushes_everything_on_stop() {
        let channel = Arc::new(Channel::new(1024 * 1024, 8));
        write_frame(&channel, 0);
        write_frame(&channel, 0);

        let flags = StageFlags::new();
        let source_flags = StageFlags::new();
        flags.set_stopping(true);

        let mut storage = Box::new(MemoryStorage::new());
        storage.start().unwrap();
        run_sink(Arc::clone(&channel), flags, source_flags, storage, 0.0, runtime_clock());
    }
}
