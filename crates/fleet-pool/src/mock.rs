//! Test adapters implementing the collaborator traits
//!
//! Mock devices, factories, validators, and reservation services with
//! controllable failure modes, for unit and integration tests.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use fleet_types::PerfSpec;
use fleet_types::Platform;

use crate::constraint::DeviceConstraint;
use crate::device::DeviceError;
use crate::device::SharedDevice;
use crate::device::TargetDevice;
use crate::error::PoolError;
use crate::error::Result;
use crate::traits::DeviceFactory;
use crate::traits::DeviceValidator;
use crate::traits::ReservationService;
use crate::traits::TimeSource;

#[derive(Debug, Default)]
struct MockDeviceState {
    on: bool,
    connected: bool,
    available: bool,
    disposed: bool,
    fail_connect: bool,
    fail_power_on: bool,
    unavailable_until_reboot: bool,
    connect_calls: u32,
    reboot_calls: u32,
}

/// In-memory target device with controllable state.
///
/// Fresh devices are powered on, available, and disconnected.
pub struct MockTargetDevice {
    name: String,
    platform: Platform,
    model: String,
    perf_spec: PerfSpec,
    state: Mutex<MockDeviceState>,
}

impl MockTargetDevice {
    pub fn new(name: impl Into<String>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            platform,
            model: String::new(),
            perf_spec: PerfSpec::Unspecified,
            state: Mutex::new(MockDeviceState {
                on: true,
                available: true,
                ..MockDeviceState::default()
            }),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_perf_spec(mut self, perf_spec: PerfSpec) -> Self {
        self.perf_spec = perf_spec;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockDeviceState> {
        self.state.lock().unwrap()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn set_fail_power_on(&self, fail: bool) {
        self.state().fail_power_on = fail;
    }

    pub fn set_powered_off(&self) {
        let mut state = self.state();
        state.on = false;
        state.connected = false;
    }

    /// Simulate a device that only becomes available after a reboot.
    pub fn set_unavailable_until_reboot(&self) {
        let mut state = self.state();
        state.available = false;
        state.unavailable_until_reboot = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.state().disposed
    }

    pub fn connect_count(&self) -> u32 {
        self.state().connect_calls
    }

    pub fn reboot_count(&self) -> u32 {
        self.state().reboot_calls
    }
}

impl TargetDevice for MockTargetDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn platform(&self) -> Platform {
        self.platform.clone()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn perf_spec(&self) -> PerfSpec {
        self.perf_spec
    }

    fn is_on(&self) -> bool {
        self.state().on
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn is_available(&self) -> bool {
        self.state().available
    }

    fn power_on(&self) -> std::result::Result<(), DeviceError> {
        let mut state = self.state();
        if state.fail_power_on {
            return Err(DeviceError::new(&self.name, "power on failed"));
        }
        state.on = true;
        Ok(())
    }

    fn connect(&self) -> std::result::Result<(), DeviceError> {
        let mut state = self.state();
        state.connect_calls += 1;
        if state.fail_connect {
            return Err(DeviceError::new(&self.name, "connect failed"));
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&self) -> std::result::Result<(), DeviceError> {
        self.state().connected = false;
        Ok(())
    }

    fn reboot(&self) -> std::result::Result<(), DeviceError> {
        let mut state = self.state();
        state.reboot_calls += 1;
        state.on = true;
        state.connected = false;
        if state.unavailable_until_reboot {
            state.unavailable_until_reboot = false;
            state.available = true;
        }
        Ok(())
    }

    fn dispose(&self) {
        let mut state = self.state();
        state.disposed = true;
        state.connected = false;
        state.on = false;
    }
}

/// Factory producing `MockTargetDevice`s for a fixed set of platforms.
///
/// The definition's opaque `device_data` blob is interpreted as the model
/// string of the constructed device.
pub struct MockDeviceFactory {
    platforms: Vec<Platform>,
    fail: Mutex<HashSet<String>>,
    unavailable: Mutex<HashSet<String>>,
    created: Mutex<Vec<Arc<MockTargetDevice>>>,
}

impl MockDeviceFactory {
    pub fn new(platforms: Vec<Platform>) -> Self {
        Self {
            platforms,
            fail: Mutex::new(HashSet::new()),
            unavailable: Mutex::new(HashSet::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Make construction of the named device fail.
    pub fn fail_device(&self, name: &str) {
        self.fail.lock().unwrap().insert(name.to_string());
    }

    /// Construct the named device in an unavailable state that a reboot
    /// clears.
    pub fn make_unavailable_until_reboot(&self, name: &str) {
        self.unavailable.lock().unwrap().insert(name.to_string());
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn created_devices(&self) -> Vec<Arc<MockTargetDevice>> {
        self.created.lock().unwrap().clone()
    }
}

impl DeviceFactory for MockDeviceFactory {
    fn can_support_platform(&self, platform: &Platform) -> bool {
        self.platforms.contains(platform)
    }

    fn create_device(
        &self,
        platform: &Platform,
        name_or_address: &str,
        _cache_dir: &Path,
        device_data: &str,
    ) -> std::result::Result<SharedDevice, DeviceError> {
        if self.fail.lock().unwrap().contains(name_or_address) {
            return Err(DeviceError::new(name_or_address, "construction failed"));
        }
        let device =
            MockTargetDevice::new(name_or_address, platform.clone()).with_model(device_data);
        if self.unavailable.lock().unwrap().contains(name_or_address) {
            device.set_unavailable_until_reboot();
        }
        let device = Arc::new(device);
        self.created.lock().unwrap().push(device.clone());
        Ok(device)
    }
}

/// Validator rejecting a configurable set of devices and recording reverts.
pub struct MockDeviceValidator {
    enabled: AtomicBool,
    rejections: Mutex<HashMap<String, String>>,
    reverted: Mutex<Vec<String>>,
    validate_calls: AtomicU32,
}

impl MockDeviceValidator {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            rejections: Mutex::new(HashMap::new()),
            reverted: Mutex::new(Vec::new()),
            validate_calls: AtomicU32::new(0),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn reject_device(&self, name: &str, message: &str) {
        self.rejections
            .lock()
            .unwrap()
            .insert(name.to_string(), message.to_string());
    }

    pub fn reverted_devices(&self) -> Vec<String> {
        self.reverted.lock().unwrap().clone()
    }

    pub fn validate_calls(&self) -> u32 {
        self.validate_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockDeviceValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceValidator for MockDeviceValidator {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn validate_device(&self, device: &dyn TargetDevice) -> std::result::Result<(), String> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        match self.rejections.lock().unwrap().get(&device.name()) {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    fn revert_device(&self, device: &dyn TargetDevice) {
        self.reverted.lock().unwrap().push(device.name());
    }
}

/// Reservation service vending mock devices for a fixed set of platforms.
pub struct MockReservationService {
    name: String,
    platforms: Vec<Platform>,
    enabled: AtomicBool,
    reserved: Mutex<Vec<SharedDevice>>,
    released: Mutex<Vec<String>>,
    error_reports: Mutex<Vec<(String, String)>>,
    fail_next: AtomicBool,
    calls: AtomicU32,
    counter: AtomicU32,
}

impl MockReservationService {
    pub fn new(name: impl Into<String>, platforms: Vec<Platform>) -> Self {
        Self {
            name: name.into(),
            platforms,
            enabled: AtomicBool::new(true),
            reserved: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            error_reports: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            calls: AtomicU32::new(0),
            counter: AtomicU32::new(0),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `reserve_devices` call fail.
    pub fn fail_next_reservation(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn reservation_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn released_devices(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn error_reports(&self) -> Vec<(String, String)> {
        self.error_reports.lock().unwrap().clone()
    }
}

impl ReservationService for MockReservationService {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn reserved_devices(&self) -> Vec<SharedDevice> {
        self.reserved.lock().unwrap().clone()
    }

    fn can_support_constraint(&self, constraint: &DeviceConstraint) -> bool {
        constraint
            .platform
            .as_ref()
            .is_some_and(|p| self.platforms.contains(p))
    }

    fn reserve_devices(&self, constraints: &[DeviceConstraint]) -> Result<Vec<SharedDevice>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PoolError::ServiceFailure {
                service: self.name.clone(),
                message: "injected reservation failure".to_string(),
            });
        }
        let mut devices = Vec::new();
        for constraint in constraints {
            let platform = constraint
                .platform
                .clone()
                .unwrap_or_else(Platform::host);
            let index = self.counter.fetch_add(1, Ordering::SeqCst);
            let device = MockTargetDevice::new(format!("{}-device-{index}", self.name), platform)
                .with_model(constraint.model.clone())
                .with_perf_spec(constraint.perf_spec);
            let device: SharedDevice = Arc::new(device);
            devices.push(device.clone());
        }
        self.reserved.lock().unwrap().extend(devices.clone());
        Ok(devices)
    }

    fn release_devices(&self, devices: &[SharedDevice]) {
        let mut reserved = self.reserved.lock().unwrap();
        let mut released = self.released.lock().unwrap();
        for device in devices {
            let name = device.name();
            reserved.retain(|d| !d.name().eq_ignore_ascii_case(&name));
            device.dispose();
            released.push(name);
        }
    }

    fn report_device_error(&self, name: &str, message: &str) {
        self.error_reports
            .lock()
            .unwrap()
            .push((name.to_string(), message.to_string()));
    }
}

/// Pinned clock for availability-window tests.
pub struct FixedTimeSource {
    minutes: Mutex<u16>,
}

impl FixedTimeSource {
    /// Pin the clock to `hours:minutes` local time.
    pub fn at(hours: u16, minutes: u16) -> Self {
        Self {
            minutes: Mutex::new(hours * 60 + minutes),
        }
    }

    pub fn set(&self, hours: u16, minutes: u16) {
        *self.minutes.lock().unwrap() = hours * 60 + minutes;
    }
}

impl TimeSource for FixedTimeSource {
    fn now_local_minutes(&self) -> u16 {
        *self.minutes.lock().unwrap()
    }
}
