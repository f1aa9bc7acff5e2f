//! Error taxonomy for the device layer and the method execution engine.
//!
//! `LabError` is the single error type crossing component boundaries. It is
//! grouped by the layer that raises it:
//!
//! - **Connection layer**: `TransportUnavailable`, `AddressInUse`,
//!   `ReconnectExhausted`, `Transport`.
//! - **Registry / drivers**: `DriverNotFound`, `DriverConflict`, `Driver`,
//!   `Unsupported`, `DeviceUnavailable`.
//! - **Method engine**: `InvalidMethod`, `UnboundRole`, `CapabilityMismatch`,
//!   `StepTimeout`, `PreconditionFailed`, `UpstreamFailed`, `Aborted`.
//! - **Safety monitor**: `SafetyTripped`. A safety trip is never retried and
//!   always wins over any other root cause recorded for a run.
//!
//! The enum is `Clone` so step records and run reports can keep the error
//! that terminated them. Drivers keep using `anyhow::Result` internally; the
//! device handle converts driver failures into `LabError` at the boundary.

use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceCategory, HandleState};
use crate::method::ValidationError;

/// Convenience alias for results using the crate error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LabError {
    // =========================================================================
    // Connection layer
    // =========================================================================
    #[error("Transport unavailable at {address}: {reason}")]
    TransportUnavailable { address: String, reason: String },

    #[error("Address {address} is already held by device '{holder}'")]
    AddressInUse { address: String, holder: String },

    #[error("Reconnect of '{device}' exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        device: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Transport error on {address}: {message}")]
    Transport { address: String, message: String },

    // =========================================================================
    // Registry and drivers
    // =========================================================================
    #[error("No driver registered for {category} '{vendor_model}'")]
    DriverNotFound {
        category: DeviceCategory,
        vendor_model: String,
    },

    #[error("Driver for {category} '{vendor_model}' already registered ({existing})")]
    DriverConflict {
        category: DeviceCategory,
        vendor_model: String,
        existing: String,
    },

    #[error("Driver error on '{device}': {message}")]
    Driver { device: String, message: String },

    #[error("Device '{device}' does not support '{capability}'")]
    Unsupported { device: String, capability: String },

    #[error("Device '{device}' cannot accept operations while {state}")]
    DeviceUnavailable { device: String, state: HandleState },

    #[error("Device '{device}' is returning to safe idle")]
    StopInProgress { device: String },

    // =========================================================================
    // Method engine
    // =========================================================================
    #[error("Method '{method}' failed validation: {}", summarize(.errors))]
    InvalidMethod {
        method: String,
        errors: Vec<ValidationError>,
    },

    #[error("Role '{role}' has no compatible device: {reason}")]
    UnboundRole { role: String, reason: String },

    #[error("Step '{step}' needs '{capability}' which device '{device}' does not offer")]
    CapabilityMismatch {
        step: String,
        device: String,
        capability: String,
    },

    #[error("Step '{step}' timed out after {}", humantime_secs(.timeout))]
    StepTimeout { step: String, timeout: Duration },

    #[error("Precondition of step '{step}' failed: {reason}")]
    PreconditionFailed { step: String, reason: String },

    #[error("Step '{step}' not run because '{upstream}' did not complete")]
    UpstreamFailed { step: String, upstream: String },

    #[error("Run aborted: {reason}")]
    Aborted { reason: String },

    // =========================================================================
    // Safety monitor
    // =========================================================================
    #[error("Safety rule '{rule}' tripped on '{device}': {field} = {value}")]
    SafetyTripped {
        rule: String,
        device: String,
        field: String,
        value: f64,
    },

    // =========================================================================
    // Ambient
    // =========================================================================
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl LabError {
    /// True for errors raised by the safety monitor.
    pub fn is_safety_trip(&self) -> bool {
        matches!(self, LabError::SafetyTripped { .. })
    }

    /// True for errors that indicate the physical channel is broken and the
    /// owning handle should be faulted.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LabError::Transport { .. } | LabError::TransportUnavailable { .. }
        )
    }

    /// Whether a retry policy may re-attempt the failed step.
    ///
    /// Safety trips, aborts and structural method errors are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LabError::SafetyTripped { .. }
                | LabError::Aborted { .. }
                | LabError::InvalidMethod { .. }
                | LabError::UnboundRole { .. }
                | LabError::CapabilityMismatch { .. }
                | LabError::Unsupported { .. }
                | LabError::UpstreamFailed { .. }
                | LabError::PreconditionFailed { .. }
        )
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        LabError::Io(err.to_string())
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn humantime_secs(timeout: &Duration) -> String {
    format!("{:.3}s", timeout.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_trip_is_never_retryable() {
        let err = LabError::SafetyTripped {
            rule: "max_temp".into(),
            device: "tc1".into(),
            field: "temperature".into(),
            value: 91.0,
        };
        assert!(err.is_safety_trip());
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeouts_and_driver_errors_are_retryable() {
        let timeout = LabError::StepTimeout {
            step: "wait".into(),
            timeout: Duration::from_secs(30),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "Step 'wait' timed out after 30.000s");

        let driver = LabError::Driver {
            device: "pump1".into(),
            message: "stall".into(),
        };
        assert!(driver.is_retryable());
        assert!(!driver.is_transport());
    }

    #[test]
    fn io_errors_convert_to_string_form() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LabError = io.into();
        assert!(matches!(err, LabError::Io(msg) if msg.contains("missing")));
    }
}
