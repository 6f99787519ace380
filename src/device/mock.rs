//! In-memory mock devices used by tests and by callers without real
//! hardware: "simulated" cameras and "Trash"/"memory" storage backends.

use rand::Rng;

use super::{Camera, DeviceManager, DeviceState, Storage};
use crate::frame::{ImageShape, SampleType};

/// A camera that always produces zero-valued pixels, deterministically and
/// quickly — for smoke tests that only care about frame counts and shape.
pub struct SimulatedEmptyCamera {
    identifier: String,
    shape: ImageShape,
    state: DeviceState,
    settings: std::collections::BTreeMap<String, String>,
    next_frame_id: u64,
}

impl SimulatedEmptyCamera {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            identifier: "simulated: empty".to_string(),
            shape: ImageShape::new(width, height, 1, SampleType::U8),
            state: DeviceState::AwaitingConfiguration,
            settings: std::collections::BTreeMap::new(),
            next_frame_id: 0,
        }
    }
}

impl Camera for SimulatedEmptyCamera {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.settings.get(key).cloned()
    }

    fn get_image_shape(&self) -> Result<ImageShape, String> {
        Ok(self.shape)
    }

    fn get_state(&self) -> DeviceState {
        self.state
    }

    fn start(&mut self) -> Result<(), String> {
        self.state = DeviceState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        self.state = DeviceState::Armed;
        Ok(())
    }

    fn execute_trigger(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn get_frame(&mut self, payload: &mut [u8]) -> Result<(usize, u64, u64), String> {
        payload.fill(0);
        let hw_id = self.next_frame_id;
        self.next_frame_id += 1;
        Ok((payload.len(), hw_id, hw_id))
    }
}

/// A camera that produces uniform random pixels, for statistical
/// properties of the averaging filter (mean/variance scaling).
pub struct SimulatedRandomCamera {
    identifier: String,
    shape: ImageShape,
    state: DeviceState,
    settings: std::collections::BTreeMap<String, String>,
    next_frame_id: u64,
}

impl SimulatedRandomCamera {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            identifier: "simulated: random".to_string(),
            shape: ImageShape::new(width, height, 1, SampleType::U8),
            state: DeviceState::AwaitingConfiguration,
            settings: std::collections::BTreeMap::new(),
            next_frame_id: 0,
        }
    }
}

impl Camera for SimulatedRandomCamera {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.settings.get(key).cloned()
    }

    fn get_image_shape(&self) -> Result<ImageShape, String> {
        Ok(self.shape)
    }

    fn get_state(&self) -> DeviceState {
        self.state
    }

    fn start(&mut self) -> Result<(), String> {
        self.state = DeviceState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        self.state = DeviceState::Armed;
        Ok(())
    }

    fn execute_trigger(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn get_frame(&mut self, payload: &mut [u8]) -> Result<(usize, u64, u64), String> {
        let mut rng = rand::thread_rng();
        rng.fill(payload);
        let hw_id = self.next_frame_id;
        self.next_frame_id += 1;
        Ok((payload.len(), hw_id, hw_id))
    }
}

/// A camera whose `hardware_frame_id` intentionally skips values, to
/// exercise the source stage's dropped-frame warning path (scenario S5).
pub struct HardwareGapCamera {
    identifier: String,
    shape: ImageShape,
    state: DeviceState,
    settings: std::collections::BTreeMap<String, String>,
    software_frame_id: u64,
    hardware_frame_id: u64,
    gap_every: u64,
}

impl HardwareGapCamera {
    #[must_use]
    pub fn new(width: u32, height: u32, gap_every: u64) -> Self {
        Self {
            identifier: "simulated: hardware-gap".to_string(),
            shape: ImageShape::new(width, height, 1, SampleType::U8),
            state: DeviceState::AwaitingConfiguration,
            settings: std::collections::BTreeMap::new(),
            software_frame_id: 0,
            hardware_frame_id: 0,
            gap_every: gap_every.max(2),
        }
    }
}

impl Camera for HardwareGapCamera {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.settings.get(key).cloned()
    }

    fn get_image_shape(&self) -> Result<ImageShape, String> {
        Ok(self.shape)
    }

    fn get_state(&self) -> DeviceState {
        self.state
    }

    fn start(&mut self) -> Result<(), String> {
        self.state = DeviceState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        self.state = DeviceState::Armed;
        Ok(())
    }

    fn execute_trigger(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn get_frame(&mut self, payload: &mut [u8]) -> Result<(usize, u64, u64), String> {
        payload.fill(0);
        self.hardware_frame_id += 1;
        if self.software_frame_id > 0 && self.software_frame_id % self.gap_every == 0 {
            self.hardware_frame_id += 1;
        }
        let hw_id = self.hardware_frame_id;
        self.software_frame_id += 1;
        Ok((payload.len(), hw_id, hw_id))
    }
}

/// A storage device that discards everything appended to it, tracking only
/// a byte count.
pub struct TrashStorage {
    identifier: String,
    state: DeviceState,
    settings: std::collections::BTreeMap<String, String>,
    bytes_appended: u64,
}

impl TrashStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identifier: "Trash".to_string(),
            state: DeviceState::AwaitingConfiguration,
            settings: std::collections::BTreeMap::new(),
            bytes_appended: 0,
        }
    }

    #[must_use]
    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }
}

impl Default for TrashStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for TrashStorage {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.settings.get(key).cloned()
    }

    fn reserve_image_shape(&mut self, _shape: &ImageShape) -> Result<(), String> {
        Ok(())
    }

    fn get_state(&self) -> DeviceState {
        self.state
    }

    fn start(&mut self) -> Result<(), String> {
        self.state = DeviceState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        self.state = DeviceState::Armed;
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<(), String> {
        self.bytes_appended += data.len() as u64;
        Ok(())
    }
}

/// A storage device that retains every appended byte range, for tests
/// that assert on the frames actually written.
#[derive(Default)]
pub struct MemoryStorage {
    identifier: String,
    state: DeviceState,
    settings: std::collections::BTreeMap<String, String>,
    buffer: Vec<u8>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identifier: "memory".to_string(),
            state: DeviceState::AwaitingConfiguration,
            settings: std::collections::BTreeMap::new(),
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub fn written(&self) -> &[u8] {
        &self.buffer
    }
}

impl Storage for MemoryStorage {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.settings.get(key).cloned()
    }

    fn reserve_image_shape(&mut self, _shape: &ImageShape) -> Result<(), String> {
        Ok(())
    }

    fn get_state(&self) -> DeviceState {
        self.state
    }

    fn start(&mut self) -> Result<(), String> {
        self.state = DeviceState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        self.state = DeviceState::Armed;
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<(), String> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }
}

/// A fixed registry of named mock devices, selectable by prefix.
#[derive(Default)]
pub struct MockDeviceManager {
    identifiers: Vec<String>,
}

impl MockDeviceManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identifiers: vec![
                "simulated: empty".to_string(),
                "simulated: random".to_string(),
                "simulated: hardware-gap".to_string(),
                "Trash".to_string(),
                "memory".to_string(),
            ],
        }
    }
}

impl DeviceManager for MockDeviceManager {
    fn count(&self) -> usize {
        self.identifiers.len()
    }

    fn get(&self, index: usize) -> Option<&str> {
        self.identifiers.get(index).map(String::as_str)
    }

    fn select_first(&self, name_prefix: &str) -> Option<&str> {
        self.identifiers
            .iter()
            .find(|id| id.starts_with(name_prefix))
            .map(String::as_str)
    }
}
