//! Shared type definitions for the device fleet
//!
//! This crate contains the value types shared across the fleet components:
//! platform identifiers, performance tiers, availability windows, and static
//! device definitions together with their file/reference-string parsers.

mod definition;
mod window;

pub use definition::parse_definition_list;
pub use definition::parse_reference_list;
pub use definition::DeviceDefinition;
pub use definition::DeviceReference;
pub use window::AvailabilityWindow;

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use thiserror::Error;

/// Errors produced while parsing fleet type values.
#[derive(Debug, Error)]
pub enum TypesError {
    #[error("Invalid availability window: {value}")]
    InvalidWindow { value: String },

    #[error("Invalid performance spec: {value}")]
    InvalidPerfSpec { value: String },

    #[error("Invalid device reference token: {token}")]
    InvalidReference { token: String },

    #[error("Device definition parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for fleet type parsing.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Platform identifier for a device.
///
/// Comparison and hashing are case-insensitive; the original spelling is
/// preserved for display.
#[derive(Debug, Clone)]
pub struct Platform(String);

impl Platform {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this platform is a desktop (local-machine) platform.
    pub fn is_desktop(&self) -> bool {
        const DESKTOP_PLATFORMS: &[&str] = &["Win64", "Mac", "Linux"];
        DESKTOP_PLATFORMS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&self.0))
    }

    /// The desktop platform of the machine the pool is running on.
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            Self::new("Win64")
        } else if cfg!(target_os = "macos") {
            Self::new("Mac")
        } else {
            Self::new("Linux")
        }
    }
}

impl PartialEq for Platform {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Platform {}

impl Hash for Platform {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Platform {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

/// Performance tier required of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PerfSpec {
    #[default]
    Unspecified,
    Minimum,
    Recommended,
    High,
}

impl fmt::Display for PerfSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromStr for PerfSpec {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "unspecified" => Ok(Self::Unspecified),
            "minimum" => Ok(Self::Minimum),
            "recommended" => Ok(Self::Recommended),
            "high" => Ok(Self::High),
            _ => Err(TypesError::InvalidPerfSpec {
                value: s.to_string(),
            }),
        }
    }
}

impl Serialize for PerfSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PerfSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_comparison_ignores_case() {
        assert_eq!(Platform::new("Win64"), Platform::new("win64"));
        assert_ne!(Platform::new("Win64"), Platform::new("Android"));
    }

    #[test]
    fn platform_display_preserves_spelling() {
        assert_eq!(Platform::new("SwitchDevKit").to_string(), "SwitchDevKit");
    }

    #[test]
    fn desktop_platform_classification() {
        assert!(Platform::new("Win64").is_desktop());
        assert!(Platform::new("linux").is_desktop());
        assert!(!Platform::new("Android").is_desktop());
        assert!(Platform::host().is_desktop());
    }

    #[test]
    fn perf_spec_parses_case_insensitively() {
        assert_eq!("recommended".parse::<PerfSpec>().unwrap(), PerfSpec::Recommended);
        assert_eq!("HIGH".parse::<PerfSpec>().unwrap(), PerfSpec::High);
        assert_eq!("".parse::<PerfSpec>().unwrap(), PerfSpec::Unspecified);
        assert!("ultra".parse::<PerfSpec>().is_err());
    }
}
