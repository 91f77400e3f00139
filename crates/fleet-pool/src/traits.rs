//! Constructor-injected collaborator traits
//!
//! The pool is wired with explicit lists of factories, validators, and
//! reservation services at construction; nothing is discovered at runtime.

use std::path::Path;

use chrono::Local;
use chrono::Timelike;
use fleet_types::Platform;

use crate::constraint::DeviceConstraint;
use crate::device::DeviceError;
use crate::device::SharedDevice;
use crate::device::TargetDevice;
use crate::error::Result;

/// Constructs live devices for the platforms it supports.
pub trait DeviceFactory: Send + Sync {
    fn can_support_platform(&self, platform: &Platform) -> bool;

    /// Materialize a device. `name_or_address` is the network address for
    /// remote devices and the definition name for desktop devices.
    fn create_device(
        &self,
        platform: &Platform,
        name_or_address: &str,
        cache_dir: &Path,
        device_data: &str,
    ) -> std::result::Result<SharedDevice, DeviceError>;
}

/// Checks a freshly provisioned device before it enters the pool.
///
/// A validator may apply configuration to the device (profiles, settings);
/// `revert_device` undoes that snapshot when the device is released.
pub trait DeviceValidator: Send + Sync {
    fn enabled(&self) -> bool;

    fn validate_device(&self, device: &dyn TargetDevice) -> std::result::Result<(), String>;

    fn revert_device(&self, _device: &dyn TargetDevice) {}
}

/// External service able to supply devices beyond the local fleet.
///
/// A service owns every device it has checked out: it is the sole agent
/// disposing of them, and the pool routes releases and error reports for
/// those devices back to it.
pub trait ReservationService: Send + Sync {
    fn name(&self) -> String;

    /// Static capability gate, e.g. driven by configuration presence.
    fn enabled(&self) -> bool;

    fn reserved_devices(&self) -> Vec<SharedDevice>;

    fn can_support_constraint(&self, constraint: &DeviceConstraint) -> bool;

    /// Reserve one device per listed constraint.
    fn reserve_devices(&self, constraints: &[DeviceConstraint]) -> Result<Vec<SharedDevice>>;

    fn release_devices(&self, devices: &[SharedDevice]);

    fn report_device_error(&self, name: &str, message: &str);
}

/// Clock abstraction for availability windows.
pub trait TimeSource: Send + Sync {
    /// Current wall-clock time in minutes since local midnight.
    fn now_local_minutes(&self) -> u16;
}

/// Default time source reading the local system clock.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_local_minutes(&self) -> u16 {
        let now = Local::now();
        (now.hour() * 60 + now.minute()) as u16
    }
}
