//! Source stage: pulls frames from a camera and writes them downstream.

use std::sync::Arc;
use std::time::Instant;

use log::{error, warn};

use crate::channel::Channel;
use crate::frame::{elapsed_nanos, runtime_clock, FrameHeader};
use crate::pipeline::{FilterResetSync, SharedCamera, SharedFlags, SharedShape};

/// Drives `camera`, writing each frame onto `target_channel` (the filter's
/// input channel if a filter stage follows, otherwise the sink's), until
/// `max_frame_count` is reached or `flags.is_stopping()` is observed.
///
/// `epoch` is the pipeline-wide monotonic origin shared with the sink, so
/// `timestamp_acq_thread` values this stage writes can be compared directly
/// against the sink's own `now - write_delay_ms` threshold.
///
/// On exit, signals the filter and sink to stop and stops the camera.
pub fn run_source(
    camera: SharedCamera,
    flags: SharedFlags,
    target_channel: Arc<Channel>,
    filter_flags: Option<SharedFlags>,
    sink_flags: SharedFlags,
    reset_sync: Option<Arc<FilterResetSync>>,
    max_frame_count: u64,
    epoch: Instant,
    last_shape: SharedShape,
) {
    let mut emitted: u64 = 0;
    let mut last_hw_id: Option<u64> = None;
    // Tracks whether the *previous* iteration wrote to the filter channel,
    // so a transition away from it can trigger a reset barrier. The target
    // is fixed for the lifetime of one `start` call, so this only matters
    // if a stage were ever reused across reconfiguration.
    let filter_is_target = reset_sync.is_some();
    let mut last_target_was_filter: Option<bool> = None;

    while !flags.is_stopping() && emitted < max_frame_count {
        let shape = match camera.lock().unwrap().get_image_shape() {
            Ok(s) => s,
            Err(e) => {
                error!("source: failed to query camera image shape: {e}");
                break;
            }
        };
        *last_shape.lock().unwrap() = Some(shape);

        if last_target_was_filter == Some(true) && !filter_is_target {
            if let Some(sync) = &reset_sync {
                sync.request_and_wait();
            }
        }
        last_target_was_filter = Some(filter_is_target);

        let nbytes = FrameHeader::header_bytes() + shape.payload_bytes();
        let Some(mut reservation) = target_channel.write_map(nbytes) else {
            break;
        };

        let region = reservation.as_mut_slice();
        let header_len = FrameHeader::header_bytes();
        let (header_bytes, payload) = region.split_at_mut(header_len);

        let frame_result = camera.lock().unwrap().get_frame(payload);
        let (written, hw_id) = match frame_result {
            Ok((written, hw_id, _meta)) => (written, hw_id),
            Err(e) => {
                error!("source: camera get_frame failed: {e}");
                reservation.abort();
                break;
            }
        };

        if written == 0 {
            reservation.abort();
            continue;
        }

        if emitted > 0 {
            if let Some(last) = last_hw_id {
                if hw_id > last + 1 {
                    warn!(
                        "source: dropped hardware frame(s): last={last} current={hw_id}"
                    );
                }
            }
        }
        last_hw_id = Some(hw_id);

        let header = FrameHeader {
            bytes_of_frame: nbytes as u64,
            frame_id: emitted,
            hardware_frame_id: hw_id,
            timestamp_hardware: hw_id,
            timestamp_acq_thread: elapsed_nanos(epoch, runtime_clock()),
            shape,
        };
        // SAFETY: `header_bytes` is exactly `size_of::<FrameHeader>()` long
        // and properly sized/aligned for this write, per the reservation's
        // layout (header immediately followed by payload).
        unsafe {
            std::ptr::write_unaligned(header_bytes.as_mut_ptr().cast::<FrameHeader>(), header);
        }

        reservation.commit();
        emitted += 1;
    }

    if let Some(f) = filter_flags {
        f.set_stopping(true);
    }
    sink_flags.set_stopping(true);
    if let Err(e) = camera.lock().unwrap().stop() {
        warn!("source: camera stop failed: {e}");
    }
    flags.set_running(false);
}
