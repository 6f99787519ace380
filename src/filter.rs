//! Filter stage: averages K consecutive frames into one float32 frame.
//!
//! The "accumulator" is the filter's own long-lived output write
//! reservation: input pixels are summed directly into the reserved output
//! memory, normalized by `1/count` (not `1/K`, so a partial flush on
//! shutdown is still numerically correct), and committed every K input
//! frames.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::channel::{Channel, ChannelReader, WriteReservation};
use crate::frame::{FrameHeader, FrameIterator, ImageShape, SampleType};
use crate::pipeline::{FilterResetSync, SharedFlags};
use crate::throttler::Throttler;

struct Accumulator<'a> {
    reservation: WriteReservation<'a>,
    input_shape: ImageShape,
    count: u32,
}

unsafe fn read_pixel_as_f32(payload: &[u8], sample_type: SampleType, idx: usize) -> f32 {
    match sample_type {
        SampleType::U8 => payload[idx] as f32,
        SampleType::I8 => (payload[idx] as i8) as f32,
        SampleType::U10 | SampleType::U12 | SampleType::U14 | SampleType::U16 => {
            let ptr = payload.as_ptr().add(idx * 2).cast::<u16>();
            std::ptr::read_unaligned(ptr) as f32
        }
        SampleType::I16 => {
            let ptr = payload.as_ptr().add(idx * 2).cast::<i16>();
            std::ptr::read_unaligned(ptr) as f32
        }
        SampleType::F32 => {
            let ptr = payload.as_ptr().add(idx * 4).cast::<f32>();
            std::ptr::read_unaligned(ptr)
        }
    }
}

unsafe fn write_f32(payload: &mut [u8], idx: usize, value: f32) {
    let ptr = payload.as_mut_ptr().add(idx * 4).cast::<f32>();
    std::ptr::write_unaligned(ptr, value);
}

unsafe fn read_f32(payload: &[u8], idx: usize) -> f32 {
    let ptr = payload.as_ptr().add(idx * 4).cast::<f32>();
    std::ptr::read_unaligned(ptr)
}

/// Processes one input frame record against the current accumulator state.
fn process_frame<'a>(
    record: &[u8],
    sink_channel: &'a Channel,
    k: u32,
    accumulator: &mut Option<Accumulator<'a>>,
    output_frame_id: &mut u64,
) {
    let header_len = FrameHeader::header_bytes();
    // SAFETY: `record` is a complete frame record written by the source
    // stage, at least `header_len` bytes long.
    let header = unsafe { std::ptr::read_unaligned(record.as_ptr().cast::<FrameHeader>()) };
    let payload = &record[header_len..];

    match accumulator {
        None => {
            let out_shape = header.shape.as_f32();
            let nbytes = header_len + out_shape.payload_bytes();
            let Some(mut reservation) = sink_channel.write_map(nbytes) else {
                return;
            };
            {
                let region = reservation.as_mut_slice();
                let (out_header_bytes, out_payload) = region.split_at_mut(header_len);
                let out_header = FrameHeader {
                    bytes_of_frame: nbytes as u64,
                    frame_id: *output_frame_id,
                    hardware_frame_id: header.hardware_frame_id,
                    timestamp_hardware: header.timestamp_hardware,
                    timestamp_acq_thread: header.timestamp_acq_thread,
                    shape: out_shape,
                };
                unsafe {
                    std::ptr::write_unaligned(
                        out_header_bytes.as_mut_ptr().cast::<FrameHeader>(),
                        out_header,
                    );
                    for i in 0..out_shape.stride_planes as usize {
                        let v = read_pixel_as_f32(payload, header.shape.sample_type, i);
                        write_f32(out_payload, i, v);
                    }
                }
            }
            *accumulator = Some(Accumulator {
                reservation,
                input_shape: header.shape,
                count: 1,
            });
        }
        Some(acc) => {
            let mut finalize: Option<bool> = None; // Some(true) = commit, Some(false) = abort
            if acc.input_shape.shape_matches(&header.shape) {
                {
                    let region = acc.reservation.as_mut_slice();
                    let out_payload = &mut region[header_len..];
                    unsafe {
                        for i in 0..header.shape.stride_planes as usize {
                            let v = read_pixel_as_f32(payload, header.shape.sample_type, i);
                            let existing = read_f32(out_payload, i);
                            write_f32(out_payload, i, existing + v);
                        }
                    }
                }
                acc.count += 1;
                if acc.count >= k {
                    let count = acc.count;
                    let region = acc.reservation.as_mut_slice();
                    let out_payload = &mut region[header_len..];
                    let n = out_payload.len() / 4;
                    unsafe {
                        for i in 0..n {
                            let v = read_f32(out_payload, i);
                            write_f32(out_payload, i, v / count as f32);
                        }
                    }
                    finalize = Some(true);
                }
            } else {
                warn!("filter: emitting early -- shape inconsistent");
                finalize = Some(false);
            }

            if let Some(commit) = finalize {
                let Accumulator { reservation, .. } = accumulator.take().unwrap();
                if commit {
                    reservation.commit();
                    *output_frame_id += 1;
                } else {
                    reservation.abort();
                }
            }
        }
    }
}

fn process_tick<'a>(
    input_channel: &Channel,
    input_reader: &mut ChannelReader,
    sink_channel: &'a Channel,
    k: u32,
    accumulator: &mut Option<Accumulator<'a>>,
    output_frame_id: &mut u64,
) {
    let slice = match input_channel.read_map(input_reader) {
        Ok(s) => s,
        Err(_) => return,
    };
    if !slice.is_empty() {
        for record in FrameIterator::new(slice) {
            process_frame(record, sink_channel, k, accumulator, output_frame_id);
        }
    }
    let consumed = slice.len();
    input_channel.read_unmap(input_reader, consumed);
}

/// Runs the filter thread loop, throttled to roughly one tick per 10ms.
pub fn run_filter(
    input: Arc<Channel>,
    output: Arc<Channel>,
    flags: SharedFlags,
    reset_sync: Arc<FilterResetSync>,
    k: u32,
) {
    let mut reader = ChannelReader::new();
    let mut accumulator: Option<Accumulator<'_>> = None;
    let mut output_frame_id: u64 = 0;
    let mut throttler = Throttler::new(Duration::from_millis(10));

    while !flags.is_stopping() {
        process_tick(&input, &mut reader, &output, k, &mut accumulator, &mut output_frame_id);
        if reset_sync.take_requested() {
            if let Some(acc) = accumulator.take() {
                acc.reservation.abort();
            }
            reset_sync.acknowledge();
        }
        throttler.wait();
    }

    process_tick(&input, &mut reader, &output, k, &mut accumulator, &mut output_frame_id);
    if let Some(acc) = accumulator.take() {
        acc.reservation.abort();
    }
    flags.set_running(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ImageShape;

    fn write_input_frame(ch: &Channel, shape: ImageShape, value: u8) {
        let nbytes = FrameHeader::header_bytes() + shape.payload_bytes();
        let mut r = ch.write_map(nbytes).unwrap();
        let region = r.as_mut_slice();
        let (hdr, payload) = region.split_at_mut(FrameHeader::header_bytes());
        let header = FrameHeader {
            bytes_of_frame: nbytes as u64,
            frame_id: 0,
            hardware_frame_id: 0,
            timestamp_hardware: 0,
            timestamp_acq_thread: 0,
            shape,
        };
        unsafe {
            std::ptr::write_unaligned(hdr.as_mut_ptr().cast::<FrameHeader>(), header);
        }
        payload.fill(value);
        r.commit();
    }

    #[test]
    fn averages_k_consecutive_frames() {
        let input = Channel::new(1024 * 1024, 8);
        let output = Channel::new(1024 * 1024, 8);
        let shape = ImageShape::new(4, 4, 1, SampleType::U8);

        write_input_frame(&input, shape, 10);
        write_input_frame(&input, shape, 20);

        let mut reader = ChannelReader::new();
        let mut accumulator: Option<Accumulator<'_>> = None;
        let mut out_id = 0u64;
        process_tick(&input, &mut reader, &output, 2, &mut accumulator, &mut out_id);

        assert_eq!(out_id, 1);
        let mut out_reader = ChannelReader::new();
        let slice = output.read_map(&mut out_reader).unwrap();
        let record = FrameIterator::new(slice).next().unwrap();
        let payload = &record[FrameHeader::header_bytes()..];
        let v = unsafe { read_f32(payload, 0) };
        assert!((v - 15.0).abs() < 1e-6);
    }
}
