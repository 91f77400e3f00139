//! Static device definitions and their parsers
//!
//! A definition describes a potential device before it is materialized:
//! where it lives, what platform and tier it offers, and when it may be
//! used. Definitions come from a JSON definitions file or from an inline
//! comma-separated reference string, and are immutable once read.

use serde::Deserialize;
use serde::Serialize;

use crate::AvailabilityWindow;
use crate::PerfSpec;
use crate::Platform;
use crate::Result;
use crate::TypesError;

/// Static description of a potential device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceDefinition {
    #[serde(alias = "name")]
    pub name: String,

    /// Network address; optional for desktop devices.
    #[serde(alias = "address")]
    pub address: String,

    /// Opaque device-specific data passed through to the factory.
    #[serde(alias = "deviceData", alias = "devicedata")]
    pub device_data: String,

    /// `Type` is a legacy alias consumed when `Platform` is absent.
    #[serde(alias = "Type", alias = "type", alias = "platform")]
    pub platform: Option<Platform>,

    #[serde(alias = "perfSpec", alias = "perfspec")]
    pub perf_spec: PerfSpec,

    /// Empty string means the base model.
    #[serde(alias = "model")]
    pub model: String,

    #[serde(alias = "available", with = "window_string")]
    pub available: AvailabilityWindow,

    /// Whether the definition is discarded when the pool shuts down.
    /// Set for definitions created on demand rather than read from
    /// configuration.
    #[serde(alias = "removeOnShutdown", alias = "removeonshutdown")]
    pub remove_on_shutdown: bool,
}

impl DeviceDefinition {
    /// Definition created on demand by the pool itself; discarded at
    /// shutdown.
    pub fn on_demand(name: impl Into<String>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            platform: Some(platform),
            remove_on_shutdown: true,
            ..Self::default()
        }
    }

    /// The identifier handed to a device factory: the address when one is
    /// set, otherwise the name.
    pub fn name_or_address(&self) -> &str {
        if self.address.is_empty() {
            &self.name
        } else {
            &self.address
        }
    }
}

/// One token of an inline device reference string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReference {
    /// None means the caller-supplied default platform applies.
    pub platform: Option<Platform>,
    pub address: String,
    pub model: String,
}

impl DeviceReference {
    /// Whether this reference is the bare `default` placeholder, expected
    /// to be fulfilled by a reservation service rather than a concrete
    /// address.
    pub fn is_default_placeholder(&self) -> bool {
        self.address.eq_ignore_ascii_case("default")
    }

    pub fn into_definition(self, default_platform: &Platform) -> DeviceDefinition {
        let platform = self.platform.unwrap_or_else(|| default_platform.clone());
        DeviceDefinition {
            name: self.address.clone(),
            address: self.address,
            platform: Some(platform),
            model: self.model,
            remove_on_shutdown: true,
            ..DeviceDefinition::default()
        }
    }
}

/// Parse a JSON array of device definitions.
pub fn parse_definition_list(json: &str) -> Result<Vec<DeviceDefinition>> {
    Ok(serde_json::from_str(json)?)
}

/// Parse a comma-separated list of `platform:address[|model]` tokens.
pub fn parse_reference_list(reference: &str) -> Result<Vec<DeviceReference>> {
    let mut references = Vec::new();
    for token in reference.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (platform, rest) = match token.split_once(':') {
            Some((platform, rest)) => (Some(Platform::new(platform.trim())), rest.trim()),
            None => (None, token),
        };
        let (address, model) = match rest.split_once('|') {
            Some((address, model)) => (address.trim(), model.trim()),
            None => (rest, ""),
        };
        if address.is_empty() {
            return Err(TypesError::InvalidReference {
                token: token.to_string(),
            });
        }
        references.push(DeviceReference {
            platform,
            address: address.to_string(),
            model: model.to_string(),
        });
    }
    Ok(references)
}

mod window_string {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    use crate::AvailabilityWindow;

    pub fn serialize<S: Serializer>(
        window: &AvailabilityWindow,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let value = match *window {
            AvailabilityWindow::Disabled => "disabled".to_string(),
            AvailabilityWindow::Always => String::new(),
            AvailabilityWindow::Between { start, end } => format!(
                "{:02}:{:02}-{:02}:{:02}",
                start / 60,
                start % 60,
                end / 60,
                end % 60
            ),
        };
        serializer.serialize_str(&value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<AvailabilityWindow, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
