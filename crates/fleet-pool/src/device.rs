//! Target device capability surface
//!
//! The pool never drives hardware itself; it orchestrates calls against the
//! `TargetDevice` trait, which per-platform driver crates implement.

use core::error::Error;
use std::fmt;
use std::sync::Arc;

use fleet_types::PerfSpec;
use fleet_types::Platform;

/// Error returned by a device operation.
#[derive(Debug, derive_more::Display)]
#[display("{device}: {message}")]
pub struct DeviceError {
    pub device: String,
    pub message: String,
}

impl Error for DeviceError {}

impl DeviceError {
    pub fn new(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// A live device handle.
///
/// State predicates are expected to be cheap; the operations may block on
/// platform I/O. Implementations must be safe to share across the threads
/// of concurrent test runs.
pub trait TargetDevice: Send + Sync {
    fn name(&self) -> String;

    fn platform(&self) -> Platform;

    fn model(&self) -> String {
        String::new()
    }

    fn perf_spec(&self) -> PerfSpec {
        PerfSpec::Unspecified
    }

    fn is_on(&self) -> bool;

    fn is_connected(&self) -> bool;

    fn is_available(&self) -> bool;

    fn power_on(&self) -> std::result::Result<(), DeviceError>;

    fn connect(&self) -> std::result::Result<(), DeviceError>;

    fn disconnect(&self) -> std::result::Result<(), DeviceError>;

    fn reboot(&self) -> std::result::Result<(), DeviceError>;

    /// Release all driver-side resources. The handle must not be used
    /// afterwards.
    fn dispose(&self);
}

/// Stable identity of a device within the pool: platform plus
/// case-insensitive name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    platform: Platform,
    name: String,
}

impl DeviceKey {
    pub fn new(name: &str, platform: Platform) -> Self {
        Self {
            platform,
            name: name.to_ascii_lowercase(),
        }
    }

    pub fn of(device: &dyn TargetDevice) -> Self {
        Self::new(&device.name(), device.platform())
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.platform)
    }
}

/// A device marked as currently unusable after a connection or validation
/// failure. Keyed by name and platform so the underlying definition is not
/// lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemDevice {
    pub name: String,
    pub platform: Platform,
}

impl ProblemDevice {
    pub fn of(device: &dyn TargetDevice) -> Self {
        Self {
            name: device.name(),
            platform: device.platform(),
        }
    }

    pub fn matches(&self, device: &dyn TargetDevice) -> bool {
        self.name.eq_ignore_ascii_case(&device.name()) && self.platform == device.platform()
    }
}

impl fmt::Display for ProblemDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.platform)
    }
}

/// Shared device handle as stored by the pool.
pub type SharedDevice = Arc<dyn TargetDevice>;
