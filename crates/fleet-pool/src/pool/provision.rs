//! On-demand provisioning and the core allocation scan
//!
//! `enumerate_devices` feeds matching devices to a caller predicate,
//! materializing unprovisioned definitions lazily once the available set is
//! exhausted. Provisioning performs blocking I/O (device construction,
//! power, validators), so it runs outside the pool lock: the definition is
//! taken out of `unprovisioned` under the lock as a ticket and re-recorded
//! in `failed_provisions` if materialization fails, which keeps two threads
//! from provisioning the same definition.

use std::collections::HashSet;

use fleet_types::DeviceDefinition;
use rand::seq::IndexedRandom;
use rand::seq::SliceRandom;
use tracing::debug;
use tracing::warn;

use super::DevicePool;
use crate::constraint::DeviceConstraint;
use crate::device::DeviceKey;
use crate::device::SharedDevice;
use crate::device::TargetDevice;
use crate::error::PoolError;
use crate::error::Result;

impl DevicePool {
    /// Feed matching devices to `predicate` until it returns false or
    /// supply is exhausted.
    ///
    /// Available devices are offered first, in randomized order; when they
    /// run out, matching unprovisioned definitions are materialized one at
    /// a time and offered as they come up. A definition that fails to
    /// provision is recorded and skipped; the scan continues with the next
    /// candidate. Devices the predicate declines stay available.
    pub fn enumerate_devices<F>(&self, constraint: &DeviceConstraint, mut predicate: F) -> Result<()>
    where
        F: FnMut(&SharedDevice) -> bool,
    {
        let mut offered: HashSet<DeviceKey> = HashSet::new();
        loop {
            // Offer every matching available device not yet seen this scan.
            // The set is re-snapshotted each round so devices registered by
            // concurrent provisioning become visible.
            let mut fresh: Vec<SharedDevice> = {
                self.state()
                    .available
                    .iter()
                    .filter(|d| constraint.matches_device(d.as_ref()))
                    .filter(|d| !offered.contains(&DeviceKey::of(d.as_ref())))
                    .cloned()
                    .collect()
            };
            if !fresh.is_empty() {
                fresh.shuffle(&mut rand::rng());
                for device in &fresh {
                    offered.insert(DeviceKey::of(device.as_ref()));
                    if !predicate(device) {
                        return Ok(());
                    }
                }
                continue;
            }
            let Some(definition) = self.take_matching_definition(constraint) else {
                return Ok(());
            };
            match self.create_and_register_device(&definition, Some(constraint)) {
                Ok(device) => {
                    offered.insert(DeviceKey::of(device.as_ref()));
                    if !predicate(&device) {
                        return Ok(());
                    }
                }
                Err(err) => {
                    warn!(
                        "Failed to provision {}: {}",
                        definition.name_or_address(),
                        err
                    );
                    self.state().failed_provisions.push(definition);
                }
            }
        }
    }

    /// Remove one matching definition from the unprovisioned set, chosen at
    /// random. The caller holds the only reference until it is registered
    /// or recorded as failed.
    fn take_matching_definition(&self, constraint: &DeviceConstraint) -> Option<DeviceDefinition> {
        let mut state = self.state();
        let matching: Vec<usize> = state
            .unprovisioned
            .iter()
            .enumerate()
            .filter(|(_, definition)| constraint.matches_definition(definition))
            .map(|(index, _)| index)
            .collect();
        let index = *matching.choose(&mut rand::rng())?;
        Some(state.unprovisioned.remove(index))
    }

    /// Materialize a definition: factory-construct, recover availability if
    /// needed, validate, and register under `constraint`.
    pub fn create_and_register_device(
        &self,
        definition: &DeviceDefinition,
        constraint: Option<&DeviceConstraint>,
    ) -> Result<SharedDevice> {
        let name = definition.name_or_address();
        let platform = definition
            .platform
            .clone()
            .ok_or_else(|| PoolError::ProvisioningFailed {
                name: name.to_string(),
                message: "definition has no platform".to_string(),
            })?;
        let factory = self
            .factories()
            .iter()
            .find(|f| f.can_support_platform(&platform))
            .ok_or(PoolError::NoFactoryForPlatform {
                platform: platform.clone(),
            })?;
        debug!("Provisioning {} ({})", name, platform);
        let device = factory
            .create_device(&platform, name, self.cache_dir(), &definition.device_data)
            .map_err(|err| PoolError::ProvisioningFailed {
                name: name.to_string(),
                message: err.to_string(),
            })?;

        if !device.is_available() && !self.recover_availability(device.as_ref()) {
            device.dispose();
            return Err(PoolError::ProvisioningFailed {
                name: name.to_string(),
                message: "device still unavailable after disconnect and reboot".to_string(),
            });
        }

        if let Err(message) = self.validate_device(device.as_ref()) {
            device.dispose();
            return Err(PoolError::ValidationFailed {
                name: device.name(),
                message,
            });
        }

        self.register_device(device.clone(), constraint.cloned())?;
        Ok(device)
    }

    /// Force-disconnect then retry, then reboot then retry.
    fn recover_availability(&self, device: &dyn TargetDevice) -> bool {
        if let Err(err) = device.disconnect() {
            debug!("Forced disconnect of {} failed: {}", device.name(), err);
        }
        if device.is_available() {
            return true;
        }
        if let Err(err) = device.reboot() {
            warn!("Reboot of {} failed: {}", device.name(), err);
        }
        device.is_available()
    }

    /// Run every enabled validator against the device, stopping at the
    /// first rejection.
    pub(crate) fn validate_device(
        &self,
        device: &dyn TargetDevice,
    ) -> std::result::Result<(), String> {
        for validator in self.validators() {
            if validator.enabled() {
                validator.validate_device(device)?;
            }
        }
        Ok(())
    }
}
