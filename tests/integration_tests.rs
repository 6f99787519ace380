use std::time::Duration;

use video_acquire_runtime::config::{DeviceKind, DeviceSelection, StreamConfig};
use video_acquire_runtime::device::mock::{
    HardwareGapCamera, MemoryStorage, SimulatedEmptyCamera, SimulatedRandomCamera,
};
use video_acquire_runtime::device::{Camera, Storage};
use video_acquire_runtime::frame::{FrameHeader, FrameIterator};
use video_acquire_runtime::{Config, Runtime, RuntimeError, RuntimeState};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn camera_storage_config(max_frame_count: u64, frame_average_count: u32) -> StreamConfig {
    StreamConfig {
        camera: DeviceSelection {
            kind: DeviceKind::Camera,
            identifier: "simulated: empty".to_string(),
            settings: Default::default(),
        },
        storage: DeviceSelection {
            kind: DeviceKind::Storage,
            identifier: "memory".to_string(),
            settings: Default::default(),
        },
        write_delay_ms: 0.0,
        max_frame_count,
        frame_average_count,
    }
}

fn run_to_completion(rt: &mut Runtime, stream: usize) {
    // Poll until the stream reports nothing queued, bounded so a stuck
    // pipeline fails the test instead of hanging it.
    for _ in 0..200 {
        std::thread::sleep(Duration::from_millis(10));
        if rt.bytes_waiting_to_be_written_to_disk(stream) == 0 {
            std::thread::sleep(Duration::from_millis(20));
            break;
        }
    }
}

#[test]
fn s1_ten_frame_run_with_empty_camera_completes_and_flushes() {
    init_logging();
    let mut rt = Runtime::new(Config::default());
    rt.configure(0, camera_storage_config(10, 1)).unwrap();

    let camera: Box<dyn Camera> = Box::new(SimulatedEmptyCamera::new(16, 16));
    let storage: Box<dyn Storage> = Box::new(MemoryStorage::new());
    rt.start(vec![Some((camera, storage)), None]).unwrap();
    assert_eq!(rt.get_state(), RuntimeState::Running);

    run_to_completion(&mut rt, 0);

    let slice = rt.map_read(0).unwrap();
    let count = FrameIterator::new(slice).count();
    let len = slice.len();
    rt.unmap_read(0, len).unwrap();
    assert_eq!(count, 10);

    rt.stop();
    assert_eq!(rt.get_state(), RuntimeState::Armed);
}

#[test]
fn s2_abort_mid_run_stops_promptly() {
    init_logging();
    let mut rt = Runtime::new(Config::default());
    rt.configure(0, camera_storage_config(1_000_000, 1)).unwrap();

    let camera: Box<dyn Camera> = Box::new(SimulatedRandomCamera::new(64, 64));
    let storage: Box<dyn Storage> = Box::new(MemoryStorage::new());
    rt.start(vec![Some((camera, storage)), None]).unwrap();

    std::thread::sleep(Duration::from_millis(30));
    let started = std::time::Instant::now();
    rt.abort();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "abort took too long to return: {:?}",
        started.elapsed()
    );
    assert_eq!(rt.get_state(), RuntimeState::Armed);
}

#[test]
fn s3_two_streams_with_different_max_frame_counts_run_independently() {
    init_logging();
    let mut rt = Runtime::new(Config::default());
    rt.configure(0, camera_storage_config(5, 1)).unwrap();
    rt.configure(1, camera_storage_config(12, 1)).unwrap();

    let devices = vec![
        Some((
            Box::new(SimulatedEmptyCamera::new(8, 8)) as Box<dyn Camera>,
            Box::new(MemoryStorage::new()) as Box<dyn Storage>,
        )),
        Some((
            Box::new(SimulatedEmptyCamera::new(8, 8)) as Box<dyn Camera>,
            Box::new(MemoryStorage::new()) as Box<dyn Storage>,
        )),
    ];
    rt.start(devices).unwrap();

    run_to_completion(&mut rt, 0);
    run_to_completion(&mut rt, 1);

    let slice0 = rt.map_read(0).unwrap();
    let count0 = FrameIterator::new(slice0).count();
    let len0 = slice0.len();
    rt.unmap_read(0, len0).unwrap();

    let slice1 = rt.map_read(1).unwrap();
    let count1 = FrameIterator::new(slice1).count();
    let len1 = slice1.len();
    rt.unmap_read(1, len1).unwrap();

    rt.stop();

    assert_eq!(count0, 5, "stream 0 should emit exactly its configured max_frame_count");
    assert_eq!(count1, 12, "stream 1 should emit exactly its configured max_frame_count");
}

#[test]
fn s4_filter_with_k_2_halves_the_frame_count() {
    init_logging();
    let mut rt = Runtime::new(Config::default());
    rt.configure(0, camera_storage_config(20, 2)).unwrap();

    let camera: Box<dyn Camera> = Box::new(SimulatedRandomCamera::new(8, 8));
    let storage: Box<dyn Storage> = Box::new(MemoryStorage::new());
    rt.start(vec![Some((camera, storage)), None]).unwrap();

    run_to_completion(&mut rt, 0);

    let slice = rt.map_read(0).unwrap();
    let count = FrameIterator::new(slice).count();
    let len = slice.len();
    rt.unmap_read(0, len).unwrap();

    rt.stop();

    // 20 input frames averaged 2-at-a-time yields 10 output frames.
    assert_eq!(count, 10);
}

#[test]
fn s5_hardware_gap_camera_still_emits_the_full_requested_count() {
    init_logging();
    let mut rt = Runtime::new(Config::default());
    rt.configure(0, camera_storage_config(30, 1)).unwrap();

    let camera: Box<dyn Camera> = Box::new(HardwareGapCamera::new(8, 8, 5));
    let storage: Box<dyn Storage> = Box::new(MemoryStorage::new());
    rt.start(vec![Some((camera, storage)), None]).unwrap();

    run_to_completion(&mut rt, 0);

    let slice = rt.map_read(0).unwrap();
    let count = FrameIterator::new(slice).count();
    let len = slice.len();
    rt.unmap_read(0, len).unwrap();

    rt.stop();

    assert_eq!(
        count, 30,
        "dropped hardware frames are only logged, never reflected in the emitted count"
    );
}

#[test]
fn s6_starting_twice_without_stop_is_rejected_then_recovers() {
    init_logging();
    let mut rt = Runtime::new(Config::default());
    rt.configure(0, camera_storage_config(100, 1)).unwrap();

    let camera: Box<dyn Camera> = Box::new(SimulatedEmptyCamera::new(8, 8));
    let storage: Box<dyn Storage> = Box::new(MemoryStorage::new());
    rt.start(vec![Some((camera, storage)), None]).unwrap();

    let camera2: Box<dyn Camera> = Box::new(SimulatedEmptyCamera::new(8, 8));
    let storage2: Box<dyn Storage> = Box::new(MemoryStorage::new());
    let second_start = rt.start(vec![Some((camera2, storage2)), None]);
    assert!(matches!(second_start, Err(RuntimeError::AlreadyRunning)));

    rt.stop();
    assert_eq!(rt.get_state(), RuntimeState::Armed);

    let camera3: Box<dyn Camera> = Box::new(SimulatedEmptyCamera::new(8, 8));
    let storage3: Box<dyn Storage> = Box::new(MemoryStorage::new());
    rt.start(vec![Some((camera3, storage3)), None]).unwrap();
    assert_eq!(rt.get_state(), RuntimeState::Running);
    rt.stop();
}

#[test]
fn frame_headers_report_monotone_frame_ids() {
    init_logging();
    let mut rt = Runtime::new(Config::default());
    rt.configure(0, camera_storage_config(15, 1)).unwrap();

    let camera: Box<dyn Camera> = Box::new(SimulatedEmptyCamera::new(4, 4));
    let storage: Box<dyn Storage> = Box::new(MemoryStorage::new());
    rt.start(vec![Some((camera, storage)), None]).unwrap();
    run_to_completion(&mut rt, 0);

    let slice = rt.map_read(0).unwrap();
    let ids: Vec<u64> = FrameIterator::new(slice)
        .map(|record| {
            let header =
                unsafe { std::ptr::read_unaligned(record.as_ptr().cast::<FrameHeader>()) };
            header.frame_id
        })
        .collect();
    let len = slice.len();
    rt.unmap_read(0, len).unwrap();

    rt.stop();

    let expected: Vec<u64> = (0..15).collect();
    assert_eq!(ids, expected);
}
