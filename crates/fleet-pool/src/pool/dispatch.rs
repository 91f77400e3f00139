//! Capacity checking and reservation-service dispatch

use std::collections::HashMap;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DevicePool;
use crate::constraint::DeviceConstraint;
use crate::device::DeviceKey;
use crate::device::ProblemDevice;
use crate::device::SharedDevice;
use crate::error::PoolError;
use crate::error::Result;

impl DevicePool {
    /// Confirm that every constraint's demand can be met, obtaining devices
    /// from reservation services where the local fleet falls short.
    ///
    /// A constraint whose demand exceeds everything that will ever exist
    /// (local supply plus any capable service) fails fatally with
    /// `InsufficientCapacity`. A shortfall that only reflects devices being
    /// claimed right now is reported as `TemporarilyUnavailable`, which the
    /// caller is expected to retry.
    pub fn check_available_devices(
        &self,
        required: &HashMap<DeviceConstraint, usize>,
        problem_devices: &[ProblemDevice],
        use_service_devices: bool,
    ) -> Result<()> {
        let mut fatal = Vec::new();
        let mut busy = Vec::new();
        let mut service_shortfall: HashMap<DeviceConstraint, usize> = HashMap::new();
        for (constraint, &needed) in required {
            let available = self.count_devices(constraint, false, problem_devices, None);
            if available >= needed {
                continue;
            }
            let service_capable = use_service_devices
                && self
                    .services()
                    .iter()
                    .any(|s| s.can_support_constraint(constraint));
            if service_capable {
                service_shortfall.insert(constraint.clone(), needed - available);
                continue;
            }
            let total = self.count_devices(constraint, true, problem_devices, None);
            if total < needed {
                fatal.push(format!(
                    "[{constraint}] required {needed}, total {total}"
                ));
            } else {
                busy.push(format!(
                    "[{constraint}] required {needed}, available {available}"
                ));
            }
        }
        fatal.sort();
        busy.sort();
        if !fatal.is_empty() {
            return Err(PoolError::InsufficientCapacity {
                details: fatal.join("; "),
            });
        }
        if !service_shortfall.is_empty() {
            let devices = self.reserve_from_services(&service_shortfall)?;
            debug!(
                "Obtained {} devices from reservation services",
                devices.len()
            );
        }
        if !busy.is_empty() {
            return Err(PoolError::TemporarilyUnavailable {
                details: busy.join("; "),
            });
        }
        Ok(())
    }

    /// Delegate unmet demand to the registered reservation services.
    ///
    /// The request map is expanded into individual constraint requests and
    /// grouped by the first service that can support each. Any request no
    /// service supports fails the whole dispatch up front, naming the unmet
    /// constraints and the services consulted. Each involved service is
    /// then called once with its grouped requests; the first failing
    /// service aborts the dispatch, and devices already obtained from
    /// earlier services are kept, not rolled back.
    pub fn reserve_from_services(
        &self,
        requests: &HashMap<DeviceConstraint, usize>,
    ) -> Result<Vec<SharedDevice>> {
        let mut flat: Vec<&DeviceConstraint> = Vec::new();
        for (constraint, &count) in requests {
            for _ in 0..count {
                flat.push(constraint);
            }
        }
        flat.sort_by_key(|c| c.to_string());

        let mut grouped: HashMap<usize, Vec<DeviceConstraint>> = HashMap::new();
        let mut unmet: Vec<String> = Vec::new();
        for constraint in flat {
            match self
                .services()
                .iter()
                .position(|s| s.can_support_constraint(constraint))
            {
                Some(index) => grouped.entry(index).or_default().push(constraint.clone()),
                None => unmet.push(format!("{constraint}")),
            }
        }
        if !unmet.is_empty() {
            unmet.dedup();
            let services: Vec<String> = self.services().iter().map(|s| s.name()).collect();
            return Err(PoolError::UnsupportedConstraint {
                constraints: unmet.join(", "),
                services: services.join(", "),
            });
        }

        let mut indices: Vec<usize> = grouped.keys().copied().collect();
        indices.sort_unstable();
        let mut obtained = Vec::new();
        for index in indices {
            let constraints = &grouped[&index];
            let service = self.services()[index].clone();
            info!(
                "Requesting {} devices from reservation service {}",
                constraints.len(),
                service.name()
            );
            let devices = service
                .reserve_devices(constraints)
                .map_err(|err| PoolError::ServiceFailure {
                    service: service.name(),
                    message: err.to_string(),
                })?;
            for device in devices {
                let constraint = constraints
                    .iter()
                    .find(|c| c.matches_device(device.as_ref()))
                    .cloned()
                    .unwrap_or_else(|| DeviceConstraint::identity(device.platform()));
                if let Err(message) = self.validate_device(device.as_ref()) {
                    warn!(
                        "Service device {} failed validation: {}",
                        device.name(),
                        message
                    );
                    service.report_device_error(&device.name(), &message);
                    service.release_devices(std::slice::from_ref(&device));
                    continue;
                }
                self.register_service_device(device.clone(), constraint, index)?;
                obtained.push(device);
            }
        }
        Ok(obtained)
    }

    fn register_service_device(
        &self,
        device: SharedDevice,
        constraint: DeviceConstraint,
        service_index: usize,
    ) -> Result<()> {
        let key = DeviceKey::of(device.as_ref());
        self.register_device(device, Some(constraint))?;
        self.state().service_owned.insert(key, service_index);
        Ok(())
    }
}
