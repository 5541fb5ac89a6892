//! Move-settle-measure primitives shared by calibration and power control.
//!
//! Every device call made here is bounded by a timeout, so an unresponsive
//! mount or meter surfaces as an error instead of hanging the session.

use crate::error::{AppResult, MonetError};
use crate::hardware::{PowerSensor, RotationActuator};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-operation timeouts for device I/O.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTimeouts {
    /// Limit for a move including the wait for arrival
    #[serde(with = "humantime_serde")]
    pub move_timeout: Duration,
    /// Limit for a single power reading
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for DeviceTimeouts {
    fn default() -> Self {
        Self {
            move_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// Move to `target`, wait for arrival, then dwell for `settle_time`.
pub async fn move_and_settle(
    actuator: &dyn RotationActuator,
    target: f64,
    timeouts: &DeviceTimeouts,
    settle_time: Duration,
) -> AppResult<()> {
    let motion = async {
        actuator.move_to(target).await?;
        actuator.wait_settled().await
    };

    tokio::time::timeout(timeouts.move_timeout, motion)
        .await
        .map_err(|_| MonetError::ActuatorTimeout {
            target,
            timeout: timeouts.move_timeout,
        })??;

    if !settle_time.is_zero() {
        tokio::time::sleep(settle_time).await;
    }
    Ok(())
}

/// Mean of `averages` readings.
///
/// Non-finite readings are discarded; `Ok(None)` means none of them was usable.
/// Negative means (detector offset noise around zero) are clamped to 0 W.
pub async fn averaged_read(
    sensor: &dyn PowerSensor,
    averages: u32,
    read_timeout: Duration,
) -> AppResult<Option<f64>> {
    let mut sum = 0.0;
    let mut valid = 0u32;

    for _ in 0..averages.max(1) {
        let value = tokio::time::timeout(read_timeout, sensor.read())
            .await
            .map_err(|_| {
                MonetError::SensorFault(format!("Read timed out after {read_timeout:?}"))
            })??;

        if value.is_finite() {
            sum += value;
            valid += 1;
        } else {
            tracing::debug!(value, "Discarding non-finite power reading");
        }
    }

    Ok((valid > 0).then(|| (sum / f64::from(valid)).max(0.0)))
}
