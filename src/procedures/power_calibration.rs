//! Power Calibration Sweep
//!
//! Builds a `CalibrationCurve` for one wavelength by:
//! 1. Validating the sweep against the actuator's travel range
//! 2. Stepping the attenuator through every sweep position in ascending order
//! 3. Averaging several power readings at each position after it settles
//!
//! The sweep never writes to the calibration store; the caller commits the
//! returned curve.
//!
//! # Configuration
//!
//! ```toml
//! [sweep]
//! min_position = 30.0
//! max_position = 100.0
//! resolution = { step_size = 5.0 }   # or { steps = 15 }
//! settle_time = "200ms"
//! averages = 3
//! monotonic_tolerance = 0.02
//! max_points = 10000
//! ```

use super::abort::AbortSignal;
use super::acquisition::{averaged_read, move_and_settle, DeviceTimeouts};
use crate::calibration::{CalibrationCurve, CalibrationSample};
use crate::error::{AppResult, MonetError};
use crate::hardware::{PowerSensor, RotationActuator};
use crate::types::{PositionBounds, Wavelength};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Configuration
// =============================================================================

/// How the sweep range is subdivided.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepResolution {
    /// Number of evenly spaced positions, both ends included
    Steps(usize),
    /// Fixed increment (deg) starting at the minimum, up to and including the maximum
    StepSize(f64),
}

/// Typed configuration for a calibration sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// First sweep position (deg)
    #[serde(default = "default_min_position")]
    pub min_position: f64,

    /// Last sweep position (deg)
    #[serde(default = "default_max_position")]
    pub max_position: f64,

    /// Subdivision of the range
    #[serde(default = "default_resolution")]
    pub resolution: SweepResolution,

    /// Dwell after each move before reading
    #[serde(default = "default_settle_time", with = "humantime_serde")]
    pub settle_time: Duration,

    /// Readings averaged per position
    #[serde(default = "default_averages")]
    pub averages: u32,

    /// Fraction of the power span a step may go against the trend before the
    /// curve is flagged non-monotonic
    #[serde(default = "default_monotonic_tolerance")]
    pub monotonic_tolerance: f64,

    /// Largest number of positions a single sweep may visit
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

fn default_min_position() -> f64 {
    30.0
}
fn default_max_position() -> f64 {
    100.0
}
fn default_resolution() -> SweepResolution {
    SweepResolution::StepSize(5.0)
}
fn default_settle_time() -> Duration {
    Duration::from_millis(200)
}
fn default_averages() -> u32 {
    3
}
fn default_monotonic_tolerance() -> f64 {
    0.02
}
fn default_max_points() -> usize {
    10_000
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            min_position: default_min_position(),
            max_position: default_max_position(),
            resolution: default_resolution(),
            settle_time: default_settle_time(),
            averages: default_averages(),
            monotonic_tolerance: default_monotonic_tolerance(),
            max_points: default_max_points(),
        }
    }
}

impl SweepConfig {
    /// Check the sweep can run on an actuator with `bounds`.
    pub fn validate(&self, bounds: PositionBounds) -> AppResult<()> {
        let (min, max) = (self.min_position, self.max_position);
        if !min.is_finite() || !max.is_finite() {
            return Err(MonetError::Configuration(format!(
                "Sweep range must be finite, got [{min}, {max}]"
            )));
        }
        if min >= max {
            return Err(MonetError::Configuration(format!(
                "Sweep minimum ({min}) must be below maximum ({max})"
            )));
        }
        if !bounds.contains(min) || !bounds.contains(max) {
            return Err(MonetError::Configuration(format!(
                "Sweep range [{min}, {max}] exceeds actuator travel [{}, {}]",
                bounds.min, bounds.max
            )));
        }
        match self.resolution {
            SweepResolution::Steps(n) if n < 2 => {
                return Err(MonetError::Configuration(format!(
                    "A sweep needs at least 2 positions, got {n}"
                )));
            }
            SweepResolution::StepSize(s) if !(s.is_finite() && s > 0.0) => {
                return Err(MonetError::Configuration(format!(
                    "Step size must be positive, got {s}"
                )));
            }
            _ => {}
        }
        let points = self.point_count();
        if points > self.max_points as f64 {
            return Err(MonetError::Configuration(format!(
                "Sweep would visit {points} positions, more than the limit of {}",
                self.max_points
            )));
        }
        if self.averages == 0 {
            return Err(MonetError::Configuration(
                "At least one reading per position is required".to_string(),
            ));
        }
        if !(self.monotonic_tolerance.is_finite() && self.monotonic_tolerance >= 0.0) {
            return Err(MonetError::Configuration(format!(
                "Monotonic tolerance must be >= 0, got {}",
                self.monotonic_tolerance
            )));
        }
        Ok(())
    }

    /// Number of positions the sweep visits, computed without building them.
    fn point_count(&self) -> f64 {
        match self.resolution {
            SweepResolution::Steps(n) => n as f64,
            SweepResolution::StepSize(s) => {
                ((self.max_position - self.min_position) / s * (1.0 + 1e-9)).floor() + 1.0
            }
        }
    }

    /// Sweep positions in ascending order.
    pub fn positions(&self) -> Vec<f64> {
        let (min, max) = (self.min_position, self.max_position);
        match self.resolution {
            SweepResolution::Steps(n) if n >= 2 => {
                let step = (max - min) / (n - 1) as f64;
                (0..n)
                    .map(|i| if i == n - 1 { max } else { min + i as f64 * step })
                    .collect()
            }
            SweepResolution::StepSize(s) if s > 0.0 && max > min => {
                let epsilon = s * 1e-9;
                (0..)
                    .map(|i| min + i as f64 * s)
                    .take_while(|p| *p <= max + epsilon)
                    .map(|p| p.min(max))
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// Sweep
// =============================================================================

/// Run a calibration sweep at `wavelength` and build its curve.
///
/// Positions where every reading is non-finite are skipped. The abort signal
/// is checked before each move; an abort leaves the actuator at its last
/// commanded position and returns `Aborted`.
#[tracing::instrument(
    skip_all,
    fields(wavelength_nm = wavelength.nanometers(), points = tracing::field::Empty)
)]
pub async fn build_curve(
    wavelength: Wavelength,
    actuator: &dyn RotationActuator,
    sensor: &dyn PowerSensor,
    sweep: &SweepConfig,
    timeouts: &DeviceTimeouts,
    abort: &AbortSignal,
) -> AppResult<CalibrationCurve> {
    sweep.validate(actuator.bounds())?;
    let positions = sweep.positions();
    tracing::Span::current().record("points", positions.len());

    let started = Instant::now();
    let mut samples = Vec::with_capacity(positions.len());
    let mut last_commanded = None;
    let mut skipped = 0usize;

    tracing::info!(
        min = sweep.min_position,
        max = sweep.max_position,
        averages = sweep.averages,
        "Starting calibration sweep"
    );

    for (index, &position) in positions.iter().enumerate() {
        if abort.is_triggered() {
            tracing::warn!(
                reason = abort.reason().as_deref().unwrap_or("unspecified"),
                completed = index,
                "Calibration sweep aborted"
            );
            return Err(MonetError::Aborted {
                position: last_commanded,
            });
        }

        move_and_settle(actuator, position, timeouts, sweep.settle_time).await?;
        last_commanded = Some(position);

        match averaged_read(sensor, sweep.averages, timeouts.read_timeout).await? {
            Some(power) => {
                tracing::debug!(position, power, "Calibration point");
                samples.push(CalibrationSample::now(position, power));
            }
            None => {
                skipped += 1;
                tracing::warn!(position, "No valid reading, skipping calibration point");
            }
        }
    }

    let curve = CalibrationCurve::from_samples(wavelength, samples, sweep.monotonic_tolerance)?;
    let (min_power, max_power) = curve.power_range();

    if curve.is_non_monotonic() {
        tracing::warn!(
            trend = ?curve.trend(),
            "Calibration curve is non-monotonic; power targets may map to several positions"
        );
    }
    tracing::info!(
        samples = curve.len(),
        skipped,
        min_power,
        max_power,
        elapsed = ?started.elapsed(),
        "Calibration sweep complete"
    );

    Ok(curve)
}
