//! Device fleet pool for concurrent automated test runs
//!
//! Allocates physical and virtual test devices (consoles, phones, desktops)
//! to concurrent test processes. Devices are described by immutable
//! definitions, materialized lazily through injected factories, matched
//! against multi-attribute constraints, and claimed by short-lived
//! reservation sessions. When the local fleet is insufficient, demand is
//! dispatched to pluggable remote reservation services.

pub mod config;
pub mod constraint;
pub mod device;
pub mod error;
pub mod logging;
pub mod mock;
pub mod pool;
pub mod reservation;
pub mod traits;

pub use config::PoolOptions;
pub use config::SessionOptions;
pub use constraint::DeviceConstraint;
pub use device::DeviceError;
pub use device::DeviceKey;
pub use device::ProblemDevice;
pub use device::SharedDevice;
pub use device::TargetDevice;
pub use error::PoolError;
pub use error::Result;
pub use pool::DevicePool;
pub use pool::DevicePoolBuilder;
pub use reservation::ReservationSession;
pub use traits::DeviceFactory;
pub use traits::DeviceValidator;
pub use traits::ReservationService;
pub use traits::SystemTimeSource;
pub use traits::TimeSource;
