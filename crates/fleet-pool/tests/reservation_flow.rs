//! Integration tests driving the pool and reservation sessions through the
//! public API with mock collaborators.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use fleet_pool::mock::FixedTimeSource;
use fleet_pool::mock::MockDeviceFactory;
use fleet_pool::mock::MockDeviceValidator;
use fleet_pool::mock::MockReservationService;
use fleet_pool::DeviceConstraint;
use fleet_pool::DevicePool;
use fleet_pool::PoolError;
use fleet_pool::ReservationService;
use fleet_pool::ReservationSession;
use fleet_pool::SessionOptions;
use fleet_types::Platform;
use similar_asserts::assert_eq;
use test_log::test;

fn switch() -> Platform {
    Platform::new("Switch")
}

fn identity(platform: &str) -> DeviceConstraint {
    DeviceConstraint::identity(Platform::new(platform))
}

fn required(constraint: DeviceConstraint, count: usize) -> HashMap<DeviceConstraint, usize> {
    let mut map = HashMap::new();
    map.insert(constraint, count);
    map
}

#[test]
fn reserves_devices_provisioned_from_a_definitions_file() {
    let definitions = r#"[
        { "Name": "kit-01", "Address": "10.0.0.1", "Platform": "Switch" },
        { "Name": "kit-02", "Address": "10.0.0.2", "Platform": "Switch" },
        { "Name": "kit-03", "Address": "10.0.0.3", "Platform": "Switch", "Available": "disabled" }
    ]"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(definitions.as_bytes()).unwrap();

    let factory = Arc::new(MockDeviceFactory::new(vec![switch()]));
    let pool = DevicePool::builder().with_factory(factory).build();
    let added = pool
        .add_devices(&switch(), file.path().to_str().unwrap(), true)
        .unwrap();
    assert_eq!(added, 2);

    let mut session = ReservationSession::new(pool.clone());
    session
        .try_reserve_devices(
            &required(identity("Switch"), 2),
            2,
            false,
            &SessionOptions::default(),
        )
        .unwrap();

    assert_eq!(session.reserved_devices().len(), 2);
    assert!(session.reserved_devices().iter().all(|d| d.is_connected()));
    assert_eq!(pool.unprovisioned_count(), 0);
    assert_eq!(pool.available_device_count(&identity("Switch")), 0);

    session.release_devices();
    assert_eq!(pool.available_device_count(&identity("Switch")), 2);
}

#[test]
fn availability_windows_follow_the_wall_clock() {
    let definitions = r#"[
        { "Name": "night-kit", "Address": "10.0.0.5", "Platform": "Switch", "Available": "22:00-06:00" }
    ]"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(definitions.as_bytes()).unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let clock = Arc::new(FixedTimeSource::at(23, 0));
    let pool = DevicePool::builder()
        .with_time_source(clock.clone())
        .build();
    assert_eq!(pool.add_devices(&switch(), &path, true).unwrap(), 1);

    let noon_pool = DevicePool::builder()
        .with_time_source(Arc::new(FixedTimeSource::at(12, 0)))
        .build();
    assert_eq!(noon_pool.add_devices(&switch(), &path, true).unwrap(), 0);
}

#[test]
fn model_constraints_only_match_matching_definitions() {
    let factory = Arc::new(MockDeviceFactory::new(vec![switch()]));
    let pool = DevicePool::builder().with_factory(factory).build();
    // DeviceData doubles as the mock device's model.
    let definitions = r#"[
        { "Name": "pro-kit", "Address": "10.0.0.1", "Platform": "Switch", "Model": "ProX", "DeviceData": "ProX" },
        { "Name": "base-kit", "Address": "10.0.0.2", "Platform": "Switch" }
    ]"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(definitions.as_bytes()).unwrap();
    pool.add_devices(&switch(), file.path().to_str().unwrap(), true)
        .unwrap();

    let pro = identity("Switch").with_model("ProX");
    let mut session = ReservationSession::new(pool.clone());
    session
        .try_reserve_devices(&required(pro.clone(), 1), 1, false, &SessionOptions::default())
        .unwrap();

    assert_eq!(session.reserved_devices().len(), 1);
    assert_eq!(session.reserved_devices()[0].name(), "10.0.0.1");

    // The only ProX device is claimed by the first session: retry later.
    let err = ReservationSession::new(pool.clone())
        .try_reserve_devices(&required(pro, 1), 1, false, &SessionOptions::default())
        .unwrap_err();
    assert!(matches!(err, PoolError::TemporarilyUnavailable { .. }));

    // A model no definition carries can never be satisfied.
    let never = identity("Switch").with_model("ProY");
    let err = ReservationSession::new(pool)
        .try_reserve_devices(&required(never, 1), 1, false, &SessionOptions::default())
        .unwrap_err();
    assert!(matches!(err, PoolError::InsufficientCapacity { .. }));
}

#[test]
fn shortfalls_are_topped_up_from_reservation_services() {
    let factory = Arc::new(MockDeviceFactory::new(vec![switch()]));
    let consoles = Arc::new(MockReservationService::new("consoles", vec![switch()]));
    let pool = DevicePool::builder()
        .with_factory(factory)
        .with_service(consoles.clone())
        .build();
    pool.add_virtual_devices(1, switch());

    let mut session = ReservationSession::new(pool.clone());
    session
        .try_reserve_devices(
            &required(identity("Switch"), 3),
            3,
            false,
            &SessionOptions::default(),
        )
        .unwrap();

    assert_eq!(session.reserved_devices().len(), 3);
    assert_eq!(consoles.reserved_devices().len(), 2);

    // Service devices are disposed on release; the local device returns.
    session.release_devices();
    assert_eq!(consoles.released_devices().len(), 2);
    assert_eq!(pool.available_device_count(&identity("Switch")), 1);
    assert_eq!(pool.total_device_count(&identity("Switch")), 1);
}

#[test]
fn default_reference_tokens_defer_to_capable_services() {
    let phones = Arc::new(MockReservationService::new("phones", vec![Platform::new("Android")]));
    let pool = DevicePool::builder().with_service(phones).build();

    let added = pool
        .add_devices(&Platform::new("Android"), "Android:default", true)
        .unwrap();
    assert_eq!(added, 0);

    let no_service_pool = DevicePool::builder().build();
    let added = no_service_pool
        .add_devices(&Platform::new("Android"), "Android:default", true)
        .unwrap();
    assert_eq!(added, 1);
}

#[test]
fn validators_gate_registration_and_revert_on_release() {
    let factory = Arc::new(MockDeviceFactory::new(vec![switch()]));
    let validator = Arc::new(MockDeviceValidator::new());
    let pool = DevicePool::builder()
        .with_factory(factory)
        .with_validator(validator.clone())
        .build();
    pool.add_virtual_devices(1, switch());

    let mut session = ReservationSession::new(pool.clone());
    session
        .try_reserve_devices(
            &required(identity("Switch"), 1),
            1,
            false,
            &SessionOptions::default(),
        )
        .unwrap();
    assert!(validator.validate_calls() >= 1);

    session.release_devices();
    assert_eq!(validator.reverted_devices(), vec!["VirtualDevice0".to_string()]);
}

#[test]
fn concurrent_sessions_never_share_a_device() {
    let pool = DevicePool::builder().build();
    for i in 0..8 {
        let device = fleet_pool::mock::MockTargetDevice::new(format!("kit-{i:02}"), switch());
        pool.register_device(Arc::new(device), None).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        handles.push(std::thread::spawn(move || {
            let mut session = ReservationSession::new(pool);
            session
                .try_reserve_devices(
                    &required(identity("Switch"), 2),
                    2,
                    false,
                    &SessionOptions::default(),
                )
                .unwrap();
            session
                .reserved_devices()
                .iter()
                .map(|d| d.name())
                .collect::<Vec<_>>()
        }));
    }

    let mut names: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    names.sort();
    let before = names.len();
    names.dedup();
    assert_eq!(before, 8);
    assert_eq!(names.len(), 8);
}

#[test]
fn shutdown_releases_service_devices_to_their_service() {
    let consoles = Arc::new(MockReservationService::new("consoles", vec![switch()]));
    let pool = DevicePool::builder().with_service(consoles.clone()).build();

    let mut requests = HashMap::new();
    requests.insert(identity("Switch"), 2);
    pool.reserve_from_services(&requests).unwrap();

    pool.shutdown();
    assert_eq!(consoles.released_devices().len(), 2);
    assert_eq!(pool.available_device_count(&identity("Switch")), 0);
}
