//! Custom error types for the application.
//!
//! This module defines the primary error type, `MonetError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong between the shell, the calibration engine and the
//! attenuator/power-meter pair.
//!
//! ## Error Hierarchy
//!
//! - **Device faults** (`ActuatorTimeout`, `ActuatorFault`, `SensorFault`,
//!   `UnsupportedWavelength`): raised at the capability boundary. They abort the
//!   running command immediately.
//! - **Calibration errors** (`InsufficientCalibrationData`): a sweep that cannot
//!   produce a usable curve. The calibration store is never touched.
//! - **Control errors** (`NotConfigured`, `NotCalibrated`, `TargetOutOfRange`):
//!   precondition failures, always detected before any motion.
//! - **Outcome errors** (`ConvergenceFailed`, `Aborted`): the command ran, moved
//!   hardware, and stopped early. They carry the last known position so the user
//!   can correct manually.
//! - **Ambient errors** (`Config`, `Configuration`, `Io`, `Serialization`,
//!   `InvalidCommand`): configuration loading, store persistence and shell input.
//!
//! By using `#[from]`, `MonetError` can be created from the underlying error types
//! with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MonetError>;

#[derive(Error, Debug)]
pub enum MonetError {
    #[error("Actuator did not reach {target:.3} within {timeout:?}")]
    ActuatorTimeout { target: f64, timeout: Duration },

    #[error("Actuator fault: {0}")]
    ActuatorFault(String),

    #[error("Sensor fault: {0}")]
    SensorFault(String),

    #[error("Insufficient calibration data: {0}")]
    InsufficientCalibrationData(String),

    #[error("No wavelength configured. Run `config --wavelength=<nm>` first")]
    NotConfigured,

    #[error("No calibration for {wavelength} nm. Run `calibrate` first")]
    NotCalibrated { wavelength: f64 },

    #[error("Target power {target:.6e} W outside calibrated range [{min:.6e}, {max:.6e}] W")]
    TargetOutOfRange { target: f64, min: f64, max: f64 },

    #[error(
        "Did not converge to {target:.6e} W after {iterations} iterations \
         (best {best_power:.6e} W at {best_position:.3})"
    )]
    ConvergenceFailed {
        target: f64,
        best_power: f64,
        best_position: f64,
        iterations: usize,
    },

    #[error("Aborted by user{}", .position.map(|p| format!(" (actuator at {p:.3})")).unwrap_or_default())]
    Aborted { position: Option<f64> },

    #[error("Power meter does not support wavelength {0} nm")]
    UnsupportedWavelength(f64),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl From<figment::Error> for MonetError {
    fn from(value: figment::Error) -> Self {
        MonetError::Config(Box::new(value))
    }
}

impl MonetError {
    /// Whether the interactive session can keep going after this error.
    ///
    /// Configuration-file and filesystem failures are reported but treated as
    /// fatal at startup; everything else leaves the session usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MonetError::Config(_) | MonetError::Io(_))
    }

    /// Whether the error originated at a device boundary.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            MonetError::ActuatorTimeout { .. }
                | MonetError::ActuatorFault(_)
                | MonetError::SensorFault(_)
                | MonetError::UnsupportedWavelength(_)
        )
    }
}
