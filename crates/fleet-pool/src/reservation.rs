//! Short-lived reservation sessions
//!
//! A session computes how many additional devices a caller still needs
//! (supporting partial top-ups of an existing reservation), pulls them from
//! the pool, establishes connections, and quarantines devices that fail to
//! come up without losing the rest of the reservation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::SessionOptions;
use crate::constraint::DeviceConstraint;
use crate::device::DeviceKey;
use crate::device::ProblemDevice;
use crate::device::SharedDevice;
use crate::device::TargetDevice;
use crate::error::PoolError;
use crate::error::Result;
use crate::pool::DevicePool;

/// One caller's claim over a set of pool devices.
///
/// The session holds back-references to pool-owned devices; every release
/// routes through the pool. Dropping the session releases whatever it still
/// holds.
pub struct ReservationSession {
    pool: Arc<DevicePool>,
    reserved: Vec<SharedDevice>,
    problems: Vec<ProblemDevice>,
}

impl ReservationSession {
    pub fn new(pool: Arc<DevicePool>) -> Self {
        Self {
            pool,
            reserved: Vec::new(),
            problems: Vec::new(),
        }
    }

    pub fn reserved_devices(&self) -> &[SharedDevice] {
        &self.reserved
    }

    pub fn problem_devices(&self) -> &[ProblemDevice] {
        &self.problems
    }

    /// The per-constraint shortfall of the current reservation: for each
    /// requested constraint, the requested count minus the devices already
    /// reserved under that exact constraint. Constraints fully satisfied
    /// are dropped; an empty result means nothing more is needed.
    pub fn partial_shortfall(
        &self,
        requested: &HashMap<DeviceConstraint, usize>,
    ) -> HashMap<DeviceConstraint, usize> {
        let mut shortfall = HashMap::new();
        for (constraint, &count) in requested {
            let held = self
                .reserved
                .iter()
                .filter(|device| {
                    self.pool
                        .get_constraint(device.as_ref())
                        .map(|bound| bound == *constraint)
                        .unwrap_or(false)
                })
                .count();
            if held < count {
                shortfall.insert(constraint.clone(), count - held);
            }
        }
        shortfall
    }

    /// Reserve devices to satisfy `required`.
    ///
    /// With `allow_partial`, an existing reservation is topped up with only
    /// the shortfall, and an under-supplied pool yields a partial success
    /// (the caller re-requests the remainder later). Without it, the call
    /// either reserves everything or leaves the session holding nothing.
    pub fn try_reserve_devices(
        &mut self,
        required: &HashMap<DeviceConstraint, usize>,
        expected_total: usize,
        allow_partial: bool,
        options: &SessionOptions,
    ) -> Result<()> {
        let mut required = required.clone();
        let mut expected_total = expected_total;
        if allow_partial && !self.reserved.is_empty() {
            required = self.partial_shortfall(&required);
            if required.is_empty() {
                debug!("Reservation already satisfied, nothing to top up");
                return Ok(());
            }
            expected_total = required.values().sum();
        } else {
            self.release_devices();
            self.problems.clear();
        }

        self.pool
            .check_available_devices(&required, &self.problems, true)?;

        let mut acquired: Vec<SharedDevice> = Vec::new();
        let mut ordered: Vec<(&DeviceConstraint, usize)> =
            required.iter().map(|(c, &n)| (c, n)).collect();
        ordered.sort_by_key(|(constraint, _)| constraint.to_string());
        for (constraint, count) in ordered {
            let mut needed = count;
            let problems = &self.problems;
            let pool = self.pool.clone();
            self.pool.enumerate_devices(constraint, |device| {
                if needed == 0 {
                    return false;
                }
                let key = DeviceKey::of(device.as_ref());
                let duplicate = acquired.iter().any(|d| DeviceKey::of(d.as_ref()) == key);
                let quarantined = problems.iter().any(|p| p.matches(device.as_ref()));
                if duplicate || quarantined || !device.is_available() {
                    // Not wanted; the device stays with the pool.
                    return true;
                }
                // Claim as we go: a device lost to a concurrent session is
                // simply skipped and the scan continues.
                if pool.claim_devices(std::slice::from_ref(device)).is_err() {
                    return true;
                }
                acquired.push(device.clone());
                needed -= 1;
                needed > 0
            })?;
        }

        for device in &acquired {
            self.establish_connection(device, options);
        }

        let mut connected = Vec::new();
        for device in acquired {
            if device.is_connected() {
                connected.push(device);
            } else {
                self.mark_problem_device(
                    device.as_ref(),
                    "device failed to connect during reservation",
                );
                self.pool.release_devices(std::slice::from_ref(&device));
            }
        }

        if connected.len() < expected_total {
            if allow_partial && !connected.is_empty() {
                info!(
                    "Partially reserved {} of {} requested devices",
                    connected.len(),
                    expected_total
                );
                self.reserved.extend(connected);
                return Ok(());
            }
            // All-or-nothing: hand back everything acquired this call so no
            // device is left claimed by a failed reservation.
            warn!(
                "Reservation failed: acquired {} of {} devices",
                connected.len(),
                expected_total
            );
            self.pool.release_devices(&connected);
            return Err(PoolError::NotEnoughDevices {
                acquired: connected.len(),
                expected: expected_total,
            });
        }

        info!("Reserved {} devices", connected.len());
        self.reserved.extend(connected);
        Ok(())
    }

    /// Power on, optionally reboot, and connect a device. Failures are
    /// logged; the caller checks `is_connected` afterwards.
    fn establish_connection(&self, device: &SharedDevice, options: &SessionOptions) {
        if !device.is_on() {
            if let Err(err) = device.power_on() {
                warn!("Failed to power on {}: {}", device.name(), err);
                return;
            }
        }
        if options.reboot_before_use {
            if let Err(err) = device.reboot() {
                warn!("Failed to reboot {}: {}", device.name(), err);
            } else if options.verify_login_after_reboot {
                if let Err(message) = self.pool.validate_device(device.as_ref()) {
                    warn!(
                        "Login verification failed for {} after reboot: {}",
                        device.name(),
                        message
                    );
                    return;
                }
            }
        }
        if !device.is_connected() {
            if let Err(err) = device.connect() {
                warn!("Failed to connect {}: {}", device.name(), err);
            }
        }
    }

    /// Release every reserved device back to the pool.
    pub fn release_devices(&mut self) {
        if self.reserved.is_empty() {
            return;
        }
        let devices = std::mem::take(&mut self.reserved);
        debug!("Releasing {} reserved devices", devices.len());
        self.pool.release_devices(&devices);
    }

    /// Release only the reserved devices currently marked as problems, then
    /// clear the problem list.
    pub fn release_problem_devices(&mut self) {
        let problems = std::mem::take(&mut self.problems);
        let (bad, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.reserved)
            .into_iter()
            .partition(|device| problems.iter().any(|p| p.matches(device.as_ref())));
        if !bad.is_empty() {
            info!("Releasing {} problem devices", bad.len());
            self.pool.release_devices(&bad);
        }
        self.reserved = kept;
    }

    /// Quarantine a device for the rest of the session. Idempotent per
    /// (name, platform): a second call for the same device is a no-op and
    /// is not re-reported to the owning service.
    pub fn mark_problem_device(&mut self, device: &dyn TargetDevice, reason: &str) {
        let problem = ProblemDevice::of(device);
        let known = self.problems.iter().any(|p| {
            p.name.eq_ignore_ascii_case(&problem.name) && p.platform == problem.platform
        });
        if known {
            return;
        }
        warn!("Marking problem device {}: {}", problem, reason);
        self.pool.report_device_error(device, reason);
        self.problems.push(problem);
    }
}

impl Drop for ReservationSession {
    fn drop(&mut self) {
        if !self.reserved.is_empty() {
            debug!(
                "Session dropped holding {} devices, releasing",
                self.reserved.len()
            );
            self.release_devices();
        }
    }
}

#[cfg(test)]
mod tests {
    use fleet_types::Platform;

    use super::*;
    use crate::mock::MockReservationService;
    use crate::mock::MockTargetDevice;

    fn switch() -> Platform {
        Platform::new("Switch")
    }

    fn identity() -> DeviceConstraint {
        DeviceConstraint::identity(switch())
    }

    fn required(count: usize) -> HashMap<DeviceConstraint, usize> {
        let mut map = HashMap::new();
        map.insert(identity(), count);
        map
    }

    fn register_kits(pool: &Arc<DevicePool>, count: usize) -> Vec<Arc<MockTargetDevice>> {
        (0..count)
            .map(|i| {
                let device = Arc::new(MockTargetDevice::new(format!("kit-{i:02}"), switch()));
                pool.register_device(device.clone(), None).unwrap();
                device
            })
            .collect()
    }

    #[test]
    fn reserves_and_connects_requested_devices() {
        let pool = DevicePool::builder().build();
        register_kits(&pool, 3);

        let mut session = ReservationSession::new(pool.clone());
        session
            .try_reserve_devices(&required(2), 2, false, &SessionOptions::default())
            .unwrap();

        assert_eq!(session.reserved_devices().len(), 2);
        assert!(session.reserved_devices().iter().all(|d| d.is_connected()));
        assert_eq!(pool.available_device_count(&identity()), 1);
    }

    #[test]
    fn shortfall_is_empty_once_satisfied() {
        let pool = DevicePool::builder().build();
        register_kits(&pool, 2);

        let mut session = ReservationSession::new(pool);
        session
            .try_reserve_devices(&required(2), 2, false, &SessionOptions::default())
            .unwrap();

        assert!(session.partial_shortfall(&required(2)).is_empty());
        assert!(session.partial_shortfall(&required(1)).is_empty());
        let shortfall = session.partial_shortfall(&required(3));
        assert_eq!(shortfall.get(&identity()), Some(&1));
    }

    #[test]
    fn partial_top_up_only_acquires_the_shortfall() {
        let pool = DevicePool::builder().build();
        register_kits(&pool, 3);

        let mut session = ReservationSession::new(pool.clone());
        session
            .try_reserve_devices(&required(1), 1, true, &SessionOptions::default())
            .unwrap();
        assert_eq!(session.reserved_devices().len(), 1);

        session
            .try_reserve_devices(&required(3), 3, true, &SessionOptions::default())
            .unwrap();
        assert_eq!(session.reserved_devices().len(), 3);
        assert_eq!(pool.available_device_count(&identity()), 0);

        // A repeat request for what is already held is a no-op.
        session
            .try_reserve_devices(&required(3), 3, true, &SessionOptions::default())
            .unwrap();
        assert_eq!(session.reserved_devices().len(), 3);
    }

    #[test]
    fn failed_full_reservation_leaves_nothing_claimed() {
        let pool = DevicePool::builder().build();
        let kits = register_kits(&pool, 2);
        kits[0].set_fail_connect(true);

        let mut session = ReservationSession::new(pool.clone());
        let err = session
            .try_reserve_devices(&required(2), 2, false, &SessionOptions::default())
            .unwrap_err();

        assert!(matches!(err, PoolError::NotEnoughDevices { .. }));
        assert_eq!(session.reserved_devices().len(), 0);
        // No leak into the claimed set: both devices are back available.
        assert_eq!(pool.available_device_count(&identity()), 2);
        assert_eq!(session.problem_devices().len(), 1);
    }

    #[test]
    fn partial_reservation_keeps_what_connected() {
        let pool = DevicePool::builder().build();
        let kits = register_kits(&pool, 3);
        kits[1].set_fail_connect(true);

        let mut session = ReservationSession::new(pool.clone());
        session
            .try_reserve_devices(&required(3), 3, true, &SessionOptions::default())
            .unwrap();

        assert_eq!(session.reserved_devices().len(), 2);
        assert_eq!(session.problem_devices().len(), 1);
        // The quarantined device was handed back to the pool.
        assert_eq!(pool.available_device_count(&identity()), 1);
    }

    #[test]
    fn powered_off_devices_are_powered_on_before_connecting() {
        let pool = DevicePool::builder().build();
        let kits = register_kits(&pool, 1);
        kits[0].set_powered_off();

        let mut session = ReservationSession::new(pool);
        session
            .try_reserve_devices(&required(1), 1, false, &SessionOptions::default())
            .unwrap();

        assert!(kits[0].is_on());
        assert!(kits[0].is_connected());
    }

    #[test]
    fn reboot_option_reboots_before_connecting() {
        let pool = DevicePool::builder().build();
        let kits = register_kits(&pool, 1);

        let options = SessionOptions {
            reboot_before_use: true,
            verify_login_after_reboot: false,
        };
        let mut session = ReservationSession::new(pool);
        session
            .try_reserve_devices(&required(1), 1, false, &options)
            .unwrap();

        assert_eq!(kits[0].reboot_count(), 1);
        assert!(kits[0].is_connected());
    }

    #[test]
    fn marking_a_problem_device_is_idempotent() {
        let consoles = Arc::new(MockReservationService::new("consoles", vec![switch()]));
        let pool = DevicePool::builder().with_service(consoles.clone()).build();
        let mut requests = HashMap::new();
        requests.insert(identity(), 1);
        let obtained = pool.reserve_from_services(&requests).unwrap();

        let mut session = ReservationSession::new(pool);
        session.mark_problem_device(obtained[0].as_ref(), "link dropped");
        session.mark_problem_device(obtained[0].as_ref(), "link dropped again");

        assert_eq!(session.problem_devices().len(), 1);
        assert_eq!(consoles.error_reports().len(), 1);
    }

    #[test]
    fn release_problem_devices_keeps_the_healthy_ones() {
        let pool = DevicePool::builder().build();
        let kits = register_kits(&pool, 2);

        let mut session = ReservationSession::new(pool.clone());
        session
            .try_reserve_devices(&required(2), 2, false, &SessionOptions::default())
            .unwrap();

        session.mark_problem_device(kits[0].as_ref(), "intermittent link");
        session.release_problem_devices();

        assert_eq!(session.reserved_devices().len(), 1);
        assert_eq!(session.problem_devices().len(), 0);
        assert_eq!(pool.available_device_count(&identity()), 1);
    }

    #[test]
    fn dropping_a_session_releases_its_devices() {
        let pool = DevicePool::builder().build();
        register_kits(&pool, 2);

        {
            let mut session = ReservationSession::new(pool.clone());
            session
                .try_reserve_devices(&required(2), 2, false, &SessionOptions::default())
                .unwrap();
            assert_eq!(pool.available_device_count(&identity()), 0);
        }
        assert_eq!(pool.available_device_count(&identity()), 2);
    }
}
