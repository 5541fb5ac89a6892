//! Closed-loop power setter.
//!
//! Drives the attenuator to the position that yields a requested power:
//! an inverse lookup on the calibration curve gives the starting position,
//! then live measurements refine it with secant steps until the reading is
//! within tolerance or the iteration/time budget runs out.
//!
//! Precondition failures (bad parameters, no curve, unreachable target) are
//! reported before the actuator moves. Motion is never rolled back.
//!
//! `max_duration` bounds the whole loop, including the iteration in flight:
//! a move or read still pending when the budget runs out is cancelled and the
//! loop ends with `ConvergenceFailed`.

use super::abort::AbortSignal;
use super::acquisition::{averaged_read, move_and_settle, DeviceTimeouts};
use crate::calibration::{CalibrationCurve, CalibrationStore};
use crate::error::{AppResult, MonetError};
use crate::hardware::{PowerSensor, RotationActuator};
use crate::types::{format_power, Wavelength};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Steps smaller than this (deg) count as no progress.
const MIN_STEP: f64 = 1e-6;

/// Live secant slopes smaller than this fraction of the curve slope are treated as zero.
const FLAT_SLOPE_RATIO: f64 = 1e-3;

/// Parameters of the feedback loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlParams {
    /// Accepted |measured - target| (W)
    pub tolerance: f64,
    /// Maximum number of move-measure iterations
    pub max_iterations: usize,
    /// Wall-clock budget for the whole loop
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,
    /// Dwell after each move before reading
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Readings averaged per iteration
    pub averages: u32,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            tolerance: 0.1e-3,
            max_iterations: 10,
            max_duration: Duration::from_secs(30),
            settle_time: Duration::from_millis(200),
            averages: 3,
        }
    }
}

impl ControlParams {
    /// Reject parameters the loop cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(MonetError::Configuration(format!(
                "Power tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(MonetError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_duration.is_zero() {
            return Err(MonetError::Configuration(
                "max_duration must be greater than zero".to_string(),
            ));
        }
        if self.averages == 0 {
            return Err(MonetError::Configuration(
                "At least one reading per iteration is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Successful outcome of a power set.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceResult {
    /// Requested power (W)
    pub target: f64,
    /// Final actuator position (deg)
    pub position: f64,
    /// Power measured at the final position (W)
    pub measured_power: f64,
    /// Move-measure iterations used
    pub iterations: usize,
    /// Time spent in the loop
    pub elapsed: Duration,
    /// The curve offered several positions for the target
    pub ambiguous_lookup: bool,
}

/// Set `target` watts at `wavelength` using the stored curve.
#[allow(clippy::too_many_arguments)]
pub async fn set_power(
    store: &CalibrationStore,
    wavelength: Wavelength,
    target: f64,
    actuator: &dyn RotationActuator,
    sensor: &dyn PowerSensor,
    params: &ControlParams,
    timeouts: &DeviceTimeouts,
    abort: &AbortSignal,
) -> AppResult<ConvergenceResult> {
    params.validate()?;
    let curve = store.get(wavelength)?;
    set_power_with_curve(&curve, target, actuator, sensor, params, timeouts, abort).await
}

/// Set `target` watts using `curve` directly.
#[tracing::instrument(
    skip_all,
    fields(wavelength_nm = curve.wavelength().nanometers(), target = %format_power(target))
)]
pub async fn set_power_with_curve(
    curve: &CalibrationCurve,
    target: f64,
    actuator: &dyn RotationActuator,
    sensor: &dyn PowerSensor,
    params: &ControlParams,
    timeouts: &DeviceTimeouts,
    abort: &AbortSignal,
) -> AppResult<ConvergenceResult> {
    params.validate()?;
    let (min_power, max_power) = curve.power_range();
    if !target.is_finite() || !curve.covers(target) {
        return Err(MonetError::TargetOutOfRange {
            target,
            min: min_power,
            max: max_power,
        });
    }

    let bounds = actuator.bounds();
    let (first, last) = curve.position_range();
    let (lo, hi) = (first.max(bounds.min), last.min(bounds.max));
    if lo > hi {
        return Err(MonetError::Configuration(format!(
            "Calibrated range [{first}, {last}] lies outside actuator travel [{}, {}]",
            bounds.min, bounds.max
        )));
    }

    let current = actuator.current_position().await?;
    let estimate = curve.inverse_lookup(target, current)?;
    if estimate.ambiguous {
        tracing::warn!(
            candidates = estimate.candidates,
            chosen = estimate.position,
            current,
            "Target power is reached at several positions; using the one nearest the actuator"
        );
    }

    let started = Instant::now();
    let mut position = estimate.position.clamp(lo, hi);
    let mut previous: Option<(f64, f64)> = None;
    let mut best: Option<(f64, f64)> = None;
    let mut last_commanded = None;
    let mut iterations = 0;

    while iterations < params.max_iterations {
        if abort.is_triggered() {
            tracing::warn!(
                reason = abort.reason().as_deref().unwrap_or("unspecified"),
                iterations,
                "Power control aborted"
            );
            return Err(MonetError::Aborted {
                position: last_commanded,
            });
        }
        let remaining = params.max_duration.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            tracing::warn!(elapsed = ?started.elapsed(), "Power control time budget exhausted");
            break;
        }

        iterations += 1;
        let step = async {
            move_and_settle(actuator, position, timeouts, params.settle_time).await?;
            averaged_read(sensor, params.averages, timeouts.read_timeout).await
        };
        let reading = match timeout(remaining, step).await {
            Ok(reading) => reading?,
            Err(_) => {
                tracing::warn!(
                    position,
                    iteration = iterations,
                    "Power control time budget exhausted during a move or read"
                );
                break;
            }
        };
        last_commanded = Some(position);

        let measured = reading.ok_or_else(|| {
            MonetError::SensorFault(format!("No valid reading at position {position:.3}"))
        })?;
        let error = target - measured;
        tracing::debug!(iteration = iterations, position, measured, error, "Control step");

        if best.map_or(true, |(_, power)| error.abs() < (target - power).abs()) {
            best = Some((position, measured));
        }

        if error.abs() <= params.tolerance {
            let elapsed = started.elapsed();
            tracing::info!(
                position,
                measured = %format_power(measured),
                iterations,
                ?elapsed,
                "Power set"
            );
            return Ok(ConvergenceResult {
                target,
                position,
                measured_power: measured,
                iterations,
                elapsed,
                ambiguous_lookup: estimate.ambiguous,
            });
        }

        let reference = curve.local_slope(position);
        let slope = match previous {
            Some((prev_position, prev_power)) => {
                let secant = (measured - prev_power) / (position - prev_position);
                if secant.is_finite()
                    && secant.abs() > reference.abs() * FLAT_SLOPE_RATIO
                    && secant.signum() == reference.signum()
                {
                    secant
                } else {
                    tracing::debug!(secant, reference, "Rejecting live slope");
                    reference
                }
            }
            None if estimate.slope.is_finite() && estimate.slope != 0.0 => estimate.slope,
            None => reference,
        };
        previous = Some((position, measured));

        let next = (position + error / slope).clamp(lo, hi);
        if (next - position).abs() < MIN_STEP {
            tracing::warn!(position, "Step clamped to the calibrated range, no further progress");
            break;
        }
        position = next;
    }

    let (best_position, best_power) = best.unwrap_or((position, f64::NAN));
    Err(MonetError::ConvergenceFailed {
        target,
        best_power,
        best_position,
        iterations,
    })
}
