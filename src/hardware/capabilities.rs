//! Device Capabilities
//!
//! The calibration engine never talks to a vendor API. It consumes two small
//! capability traits that any rotation mount / power meter pair can implement:
//!
//! - A motorized attenuator implements: `RotationActuator`
//! - An optical power meter implements: `PowerSensor`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Reports failures as typed `MonetError` variants
//! - Focuses on ONE thing
//!
//! Timeouts are not the device's business: the engine wraps every call in
//! `tokio::time::timeout` (see `procedures::acquisition`), so a driver that hangs
//! can never hang the session.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn sample<A, S>(mount: &A, meter: &S, angle: f64) -> AppResult<f64>
//! where
//!     A: RotationActuator,
//!     S: PowerSensor,
//! {
//!     mount.move_to(angle).await?;
//!     mount.wait_settled().await?;
//!     meter.read().await
//! }
//! ```

use crate::error::AppResult;
use crate::types::{PositionBounds, Wavelength};
use async_trait::async_trait;

/// Capability: Rotation Control
///
/// Motorized rotation mounts carrying a variable ND filter or a half-wave plate
/// in front of a polarizer.
///
/// # Contract
/// - Positions are in degrees
/// - `move_to` initiates motion and may return before completion
/// - `wait_settled` returns once the device reports arrival
/// - Faults are reported as `MonetError::ActuatorFault`
#[async_trait]
pub trait RotationActuator: Send + Sync {
    /// Move to absolute position (degrees).
    ///
    /// # Returns
    /// - Ok(()) if motion initiated successfully
    /// - Err(ActuatorFault) if the position is outside `bounds()` or on hardware error
    async fn move_to(&self, position: f64) -> AppResult<()>;

    /// Wait until the device reports that motion is complete.
    ///
    /// # Default Implementation
    /// Devices whose `move_to` already blocks until arrival need not override this.
    async fn wait_settled(&self) -> AppResult<()> {
        Ok(())
    }

    /// Current position in degrees (may be approximate while moving).
    async fn current_position(&self) -> AppResult<f64>;

    /// Travel limits of the device.
    fn bounds(&self) -> PositionBounds;
}

/// Capability: Optical Power Readout
///
/// # Contract
/// - `read()` performs one measurement and returns watts
/// - Readings are only meaningful after `set_wavelength_calibration` selected the
///   responsivity curve for the laser line in use
#[async_trait]
pub trait PowerSensor: Send + Sync {
    /// Read instantaneous power in watts.
    ///
    /// # Returns
    /// - Ok(watts) on successful read
    /// - Err(SensorFault) on hardware error
    async fn read(&self) -> AppResult<f64>;

    /// Select the detector's wavelength correction.
    ///
    /// # Returns
    /// - Ok(()) if the wavelength is supported
    /// - Err(UnsupportedWavelength) otherwise
    async fn set_wavelength_calibration(&self, wavelength: Wavelength) -> AppResult<()>;
}
