//! Process-wide device pool
//!
//! The pool owns the catalog of available, claimed, and not-yet-provisioned
//! devices. All set-membership changes are serialized through one mutex with
//! short hold times; provisioning I/O runs outside the lock (see
//! `provision.rs`). The pool is the sole mutator of device-set membership;
//! sessions and services hold back-references and route every release
//! through it.

mod dispatch;
mod provision;

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use fleet_types::AvailabilityWindow;
use fleet_types::DeviceDefinition;
use fleet_types::Platform;
use rand::seq::SliceRandom;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::PoolOptions;
use crate::constraint::DeviceConstraint;
use crate::device::DeviceKey;
use crate::device::ProblemDevice;
use crate::device::SharedDevice;
use crate::device::TargetDevice;
use crate::error::PoolError;
use crate::error::Result;
use crate::traits::DeviceFactory;
use crate::traits::DeviceValidator;
use crate::traits::ReservationService;
use crate::traits::SystemTimeSource;
use crate::traits::TimeSource;

/// Registry of every device the pool knows about.
///
/// A materialized device is in exactly one of `available` or `claimed`; an
/// unprovisioned definition has no pool-side identity until materialized.
#[derive(Default)]
struct PoolState {
    available: Vec<SharedDevice>,
    claimed: Vec<SharedDevice>,
    unprovisioned: Vec<DeviceDefinition>,
    /// Definitions that failed to provision, retained for diagnostics and
    /// never retried automatically.
    failed_provisions: Vec<DeviceDefinition>,
    /// Constraint bound to each registered device, immutable for the
    /// device's lifetime in the pool.
    constraints: HashMap<DeviceKey, DeviceConstraint>,
    /// Devices supplied by a reservation service, mapped to the index of
    /// the owning service.
    service_owned: HashMap<DeviceKey, usize>,
    used_platforms: HashSet<Platform>,
}

/// Builder wiring the pool's collaborators at construction time.
pub struct DevicePoolBuilder {
    factories: Vec<Arc<dyn DeviceFactory>>,
    validators: Vec<Arc<dyn DeviceValidator>>,
    services: Vec<Arc<dyn ReservationService>>,
    time: Option<Arc<dyn TimeSource>>,
    options: PoolOptions,
}

impl DevicePoolBuilder {
    pub fn with_factory(mut self, factory: Arc<dyn DeviceFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn DeviceValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_service(mut self, service: Arc<dyn ReservationService>) -> Self {
        if service.enabled() {
            self.services.push(service);
        } else {
            info!("Skipping disabled reservation service {}", service.name());
        }
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Arc<DevicePool> {
        Arc::new(DevicePool {
            state: Mutex::new(PoolState::default()),
            factories: self.factories,
            validators: self.validators,
            services: self.services,
            time: self.time.unwrap_or_else(|| Arc::new(SystemTimeSource)),
            options: self.options,
        })
    }
}

/// Catalog of available, claimed, and not-yet-materialized devices.
///
/// Constructed explicitly by the host process and shared by reference with
/// every reservation session; `shutdown` releases everything owned and the
/// instance is discarded.
pub struct DevicePool {
    state: Mutex<PoolState>,
    factories: Vec<Arc<dyn DeviceFactory>>,
    validators: Vec<Arc<dyn DeviceValidator>>,
    services: Vec<Arc<dyn ReservationService>>,
    time: Arc<dyn TimeSource>,
    options: PoolOptions,
}

impl DevicePool {
    pub fn builder() -> DevicePoolBuilder {
        DevicePoolBuilder {
            factories: Vec::new(),
            validators: Vec::new(),
            services: Vec::new(),
            time: None,
            options: PoolOptions::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("device pool lock poisoned")
    }

    /// Top up the unprovisioned definitions for the local desktop platform
    /// (or the given desktop platform) to `count`.
    pub fn add_local_devices(&self, count: usize, platform: Option<Platform>) {
        let platform = platform.unwrap_or_else(Platform::host);
        self.top_up_definitions(count, platform, "LocalDevice");
    }

    /// Top up the unprovisioned definitions for a virtual platform to
    /// `count`.
    pub fn add_virtual_devices(&self, count: usize, platform: Platform) {
        self.top_up_definitions(count, platform, "VirtualDevice");
    }

    fn top_up_definitions(&self, count: usize, platform: Platform, prefix: &str) {
        let mut state = self.state();
        let existing = state
            .unprovisioned
            .iter()
            .filter(|d| d.platform.as_ref() == Some(&platform))
            .count()
            + state
                .available
                .iter()
                .chain(state.claimed.iter())
                .filter(|d| d.platform() == platform)
                .count();
        if existing >= count {
            return;
        }
        debug!(
            "Adding {} on-demand {} definitions for {}",
            count - existing,
            prefix,
            platform
        );
        for index in existing..count {
            let definition =
                DeviceDefinition::on_demand(format!("{prefix}{index}"), platform.clone());
            state.unprovisioned.push(definition);
        }
    }

    /// Add device definitions from a JSON definitions file or an inline
    /// `platform:address[|model]` reference string. Returns the number of
    /// definitions appended.
    pub fn add_devices(
        &self,
        default_platform: &Platform,
        reference: &str,
        obey_availability: bool,
    ) -> Result<usize> {
        let mut definitions = if Path::new(reference).is_file() {
            let payload = std::fs::read_to_string(reference)?;
            let mut definitions = fleet_types::parse_definition_list(&payload)?;
            let now = self.time.now_local_minutes();
            definitions.retain(|definition| match definition.available {
                AvailabilityWindow::Disabled => false,
                window => !obey_availability || window.contains(now),
            });
            // Randomize file order so a single bad entry doesn't always
            // occupy the same slot.
            definitions.shuffle(&mut rand::rng());
            definitions
        } else {
            let references = fleet_types::parse_reference_list(reference)?;
            references
                .into_iter()
                .filter(|reference| {
                    if !reference.is_default_placeholder() {
                        return true;
                    }
                    let platform = reference
                        .platform
                        .clone()
                        .unwrap_or_else(|| default_platform.clone());
                    if !platform.is_desktop() && self.any_service_supports_platform(&platform) {
                        debug!(
                            "Skipping default {} device, expected from a reservation service",
                            platform
                        );
                        return false;
                    }
                    true
                })
                .map(|reference| reference.into_definition(default_platform))
                .collect()
        };
        for definition in &mut definitions {
            if definition.platform.is_none() {
                definition.platform = Some(default_platform.clone());
            }
        }
        let count = definitions.len();
        info!("Adding {} device definitions from {}", count, reference);
        self.state().unprovisioned.extend(definitions);
        Ok(count)
    }

    /// Move a freshly materialized device into the available set, binding
    /// its constraint for the device's lifetime in the pool.
    pub fn register_device(
        &self,
        device: SharedDevice,
        constraint: Option<DeviceConstraint>,
    ) -> Result<()> {
        let key = DeviceKey::of(device.as_ref());
        let mut state = self.state();
        if state.constraints.contains_key(&key) {
            return Err(PoolError::AlreadyRegistered {
                name: device.name(),
            });
        }
        let constraint =
            constraint.unwrap_or_else(|| DeviceConstraint::identity(device.platform()));
        info!(
            "Registered device {} ({}) under constraint [{}]",
            device.name(),
            device.platform(),
            constraint
        );
        state.used_platforms.insert(device.platform());
        state.constraints.insert(key, constraint);
        state.available.push(device);
        Ok(())
    }

    pub fn register_devices(&self, devices: Vec<SharedDevice>) -> Result<()> {
        for device in devices {
            self.register_device(device, None)?;
        }
        Ok(())
    }

    /// The constraint a device was registered under. Fails once the device
    /// has been released to its service or otherwise forgotten.
    pub fn get_constraint(&self, device: &dyn TargetDevice) -> Result<DeviceConstraint> {
        let key = DeviceKey::of(device);
        self.state()
            .constraints
            .get(&key)
            .cloned()
            .ok_or_else(|| PoolError::UnknownDevice {
                name: device.name(),
            })
    }

    /// Number of devices currently available that match the constraint,
    /// including unprovisioned definitions representing future supply.
    pub fn available_device_count(&self, constraint: &DeviceConstraint) -> usize {
        self.count_devices(constraint, false, &[], None)
    }

    /// As `available_device_count`, with an extra predicate over
    /// materialized devices.
    pub fn available_device_count_where(
        &self,
        constraint: &DeviceConstraint,
        predicate: &dyn Fn(&dyn TargetDevice) -> bool,
    ) -> usize {
        self.count_devices(constraint, false, &[], Some(predicate))
    }

    /// Number of matching devices that exist at all: available, claimed,
    /// and unprovisioned.
    pub fn total_device_count(&self, constraint: &DeviceConstraint) -> usize {
        self.count_devices(constraint, true, &[], None)
    }

    /// As `total_device_count`, with an extra predicate over materialized
    /// devices.
    pub fn total_device_count_where(
        &self,
        constraint: &DeviceConstraint,
        predicate: &dyn Fn(&dyn TargetDevice) -> bool,
    ) -> usize {
        self.count_devices(constraint, true, &[], Some(predicate))
    }

    pub(crate) fn count_devices(
        &self,
        constraint: &DeviceConstraint,
        include_claimed: bool,
        exclude: &[ProblemDevice],
        predicate: Option<&dyn Fn(&dyn TargetDevice) -> bool>,
    ) -> usize {
        let state = self.state();
        let matches = |device: &SharedDevice| {
            constraint.matches_device(device.as_ref())
                && !exclude.iter().any(|p| p.matches(device.as_ref()))
                && predicate.map_or(true, |p| p(device.as_ref()))
        };
        let mut count = state.available.iter().filter(|d| matches(d)).count();
        if include_claimed {
            count += state.claimed.iter().filter(|d| matches(d)).count();
        }
        // Unprovisioned definitions count as supply only when the
        // constraint has no model/name narrowing: a definition cannot be
        // filtered on attributes it doesn't have until materialized.
        if !constraint.has_attribute_narrowing() {
            count += state
                .unprovisioned
                .iter()
                .filter(|definition| {
                    definition
                        .platform
                        .as_ref()
                        .is_some_and(|p| constraint.matches_platform(p))
                })
                .count();
        }
        count
    }

    /// Atomically move a batch of devices from available to claimed. If any
    /// device in the batch is already claimed the whole call fails and
    /// nothing moves.
    pub fn claim_devices(&self, devices: &[SharedDevice]) -> Result<()> {
        let mut state = self.state();
        let mut keys = HashSet::new();
        for device in devices {
            let key = DeviceKey::of(device.as_ref());
            if !keys.insert(key.clone()) {
                return Err(PoolError::AlreadyClaimed {
                    name: device.name(),
                });
            }
            if state
                .claimed
                .iter()
                .any(|d| DeviceKey::of(d.as_ref()) == key)
            {
                return Err(PoolError::AlreadyClaimed {
                    name: device.name(),
                });
            }
            if !state
                .available
                .iter()
                .any(|d| DeviceKey::of(d.as_ref()) == key)
            {
                return Err(PoolError::UnknownDevice {
                    name: device.name(),
                });
            }
        }
        let (moved, kept): (Vec<_>, Vec<_>) = state
            .available
            .drain(..)
            .partition(|d| keys.contains(&DeviceKey::of(d.as_ref())));
        state.available = kept;
        debug!("Claimed {} devices", moved.len());
        state.claimed.extend(moved);
        Ok(())
    }

    /// Release devices back to the pool. Local and on-demand devices return
    /// to the front of the available set so they are reused preferentially;
    /// devices obtained from a reservation service are handed back to that
    /// service, which disposes them, and are forgotten.
    pub fn release_devices(&self, devices: &[SharedDevice]) {
        for device in devices {
            self.release_device(device);
        }
    }

    fn release_device(&self, device: &SharedDevice) {
        let key = DeviceKey::of(device.as_ref());
        for validator in &self.validators {
            if validator.enabled() {
                validator.revert_device(device.as_ref());
            }
        }
        let owning_service = {
            let mut state = self.state();
            if !state.constraints.contains_key(&key) {
                warn!("Releasing device {} never registered with the pool", key);
                return;
            }
            state.claimed.retain(|d| DeviceKey::of(d.as_ref()) != key);
            if let Some(service_index) = state.service_owned.remove(&key) {
                state.available.retain(|d| DeviceKey::of(d.as_ref()) != key);
                state.constraints.remove(&key);
                Some(self.services[service_index].clone())
            } else {
                if !state
                    .available
                    .iter()
                    .any(|d| DeviceKey::of(d.as_ref()) == key)
                {
                    state.available.insert(0, device.clone());
                }
                None
            }
        };
        if let Some(service) = owning_service {
            debug!("Returning device {} to {}", key, service.name());
            service.release_devices(std::slice::from_ref(device));
        }
    }

    /// Forward a device error to the owning reservation service, if the
    /// device came from one.
    pub fn report_device_error(&self, device: &dyn TargetDevice, message: &str) {
        let key = DeviceKey::of(device);
        let owning_service = {
            let state = self.state();
            state
                .service_owned
                .get(&key)
                .map(|&index| self.services[index].clone())
        };
        if let Some(service) = owning_service {
            service.report_device_error(&device.name(), message);
        }
    }

    pub(crate) fn any_service_supports_platform(&self, platform: &Platform) -> bool {
        let identity = DeviceConstraint::identity(platform.clone());
        self.services
            .iter()
            .any(|service| service.can_support_constraint(&identity))
    }

    pub(crate) fn validators(&self) -> &[Arc<dyn DeviceValidator>] {
        &self.validators
    }

    pub(crate) fn factories(&self) -> &[Arc<dyn DeviceFactory>] {
        &self.factories
    }

    pub(crate) fn services(&self) -> &[Arc<dyn ReservationService>] {
        &self.services
    }

    pub(crate) fn cache_dir(&self) -> &Path {
        &self.options.cache_dir
    }

    /// Platforms that have had at least one device registered; used by the
    /// host for per-platform driver teardown.
    pub fn used_platforms(&self) -> HashSet<Platform> {
        self.state().used_platforms.clone()
    }

    /// Definitions that failed to provision, for diagnostics.
    pub fn failed_provisions(&self) -> Vec<DeviceDefinition> {
        self.state().failed_provisions.clone()
    }

    pub fn unprovisioned_count(&self) -> usize {
        self.state().unprovisioned.len()
    }

    /// Release every owned resource: service devices go back to their
    /// services, everything else is disconnected and disposed. Definitions
    /// created on demand are dropped; file-sourced definitions are kept for
    /// inspection by the host.
    pub fn shutdown(&self) {
        let (devices, service_owned, platforms) = {
            let mut state = self.state();
            let mut devices = Vec::new();
            devices.append(&mut state.available);
            devices.append(&mut state.claimed);
            state.constraints.clear();
            state.unprovisioned.retain(|d| !d.remove_on_shutdown);
            let service_owned = std::mem::take(&mut state.service_owned);
            let platforms = std::mem::take(&mut state.used_platforms);
            (devices, service_owned, platforms)
        };
        info!(
            "Shutting down device pool: {} devices across {} platforms",
            devices.len(),
            platforms.len()
        );
        for device in devices {
            let key = DeviceKey::of(device.as_ref());
            if let Some(&index) = service_owned.get(&key) {
                self.services[index].release_devices(std::slice::from_ref(&device));
            } else {
                if let Err(err) = device.disconnect() {
                    warn!("Failed to disconnect {} during shutdown: {}", key, err);
                }
                device.dispose();
            }
        }
    }
}
