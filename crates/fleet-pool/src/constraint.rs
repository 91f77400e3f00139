//! Multi-attribute device constraints
//!
//! A constraint filters devices and definitions by platform, performance
//! tier, model, and device name. Empty components mean "don't care"; a
//! constraint with nothing but a platform is the identity constraint for
//! that platform and matches any of its devices.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

use fleet_types::DeviceDefinition;
use fleet_types::PerfSpec;
use fleet_types::Platform;

use crate::device::TargetDevice;

#[derive(Debug, Clone, Default)]
pub struct DeviceConstraint {
    pub platform: Option<Platform>,
    pub perf_spec: PerfSpec,
    pub model: String,
    pub device_name: String,
}

impl DeviceConstraint {
    /// The identity constraint for a platform.
    pub fn identity(platform: Platform) -> Self {
        Self {
            platform: Some(platform),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_perf_spec(mut self, perf_spec: PerfSpec) -> Self {
        self.perf_spec = perf_spec;
        self
    }

    /// True iff the constraint carries no narrowing beyond its platform.
    pub fn is_identity(&self) -> bool {
        self.perf_spec == PerfSpec::Unspecified
            && self.model.is_empty()
            && self.device_name.is_empty()
    }

    /// Whether the constraint narrows on attributes a definition only gains
    /// once materialized.
    pub fn has_attribute_narrowing(&self) -> bool {
        !self.model.is_empty() || !self.device_name.is_empty()
    }

    pub fn matches_platform(&self, platform: &Platform) -> bool {
        self.platform.as_ref() == Some(platform)
    }

    pub fn matches_device(&self, device: &dyn TargetDevice) -> bool {
        if !self.matches_platform(&device.platform()) {
            return false;
        }
        if self.is_identity() {
            return true;
        }
        self.field_matches(&device.model(), &device.name(), device.perf_spec())
    }

    pub fn matches_definition(&self, definition: &DeviceDefinition) -> bool {
        let Some(platform) = &definition.platform else {
            return false;
        };
        if !self.matches_platform(platform) {
            return false;
        }
        if self.is_identity() {
            return true;
        }
        self.field_matches(&definition.model, &definition.name, definition.perf_spec)
    }

    fn field_matches(&self, model: &str, name: &str, perf_spec: PerfSpec) -> bool {
        if !self.model.is_empty() && !self.model.eq_ignore_ascii_case(model) {
            return false;
        }
        if !self.device_name.is_empty() && !self.device_name.eq_ignore_ascii_case(name) {
            return false;
        }
        self.perf_spec == PerfSpec::Unspecified || self.perf_spec == perf_spec
    }
}

impl PartialEq for DeviceConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.platform == other.platform
            && self.perf_spec == other.perf_spec
            && self.model.eq_ignore_ascii_case(&other.model)
            && self.device_name.eq_ignore_ascii_case(&other.device_name)
    }
}

impl Eq for DeviceConstraint {}

impl Hash for DeviceConstraint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.platform.hash(state);
        self.perf_spec.hash(state);
        self.model.to_ascii_lowercase().hash(state);
        self.device_name.to_ascii_lowercase().hash(state);
    }
}

/// Stable key used for logging and for grouping in reservation-service
/// dispatch. Deterministic given the same field values.
impl fmt::Display for DeviceConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.platform {
            Some(platform) => write!(f, "{platform}")?,
            None => write!(f, "<no platform>")?,
        }
        if self.perf_spec != PerfSpec::Unspecified {
            write!(f, " perf:{}", self.perf_spec)?;
        }
        if !self.model.is_empty() {
            write!(f, " model:{}", self.model)?;
        }
        if !self.device_name.is_empty() {
            write!(f, " name:{}", self.device_name)?;
        }
        Ok(())
    }
}
