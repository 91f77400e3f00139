//! Unified error type for pool and reservation operations

use fleet_types::Platform;
use thiserror::Error;

/// Errors surfaced by the device pool and reservation sessions.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No registered factory supports platform {platform}")]
    NoFactoryForPlatform { platform: Platform },

    #[error("Provisioning failed for {name}: {message}")]
    ProvisioningFailed { name: String, message: String },

    #[error("Validation failed for {name}: {message}")]
    ValidationFailed { name: String, message: String },

    #[error("Device already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Device not registered with the pool: {name}")]
    UnknownDevice { name: String },

    #[error("Device already claimed: {name}")]
    AlreadyClaimed { name: String },

    #[error("Insufficient device capacity: {details}")]
    InsufficientCapacity { details: String },

    #[error("Devices temporarily unavailable: {details}")]
    TemporarilyUnavailable { details: String },

    #[error("No reservation service can satisfy [{constraints}] (services tried: {services})")]
    UnsupportedConstraint { constraints: String, services: String },

    #[error("Reservation service {service} failed: {message}")]
    ServiceFailure { service: String, message: String },

    #[error("Acquired {acquired} of {expected} required devices")]
    NotEnoughDevices { acquired: usize, expected: usize },

    #[error(transparent)]
    Definition(#[from] fleet_types::TypesError),

    #[error("Failed to read device definitions: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Whether the caller is expected to retry later. Capacity that exists
    /// but is currently claimed is the only retryable condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TemporarilyUnavailable { .. })
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
