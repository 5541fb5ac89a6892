//! Simulated Hardware
//!
//! Provides a simulated attenuator rig for testing and for running the shell
//! without physical devices. All mock devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockRotationMount` - rotation mount with travel limits, optional finite
//!   speed, a move log and fault injection
//! - `SimulatedPowerMeter` - power meter that evaluates a `ResponseModel` at the
//!   mount's current angle, with optional Gaussian noise
//!
//! The two share the mount's position through an `Arc<RwLock<f64>>`, so the meter
//! always "sees" whatever the mount was last driven to.

use crate::error::{AppResult, MonetError};
use crate::hardware::capabilities::{PowerSensor, RotationActuator};
use crate::types::{PositionBounds, Wavelength};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

// =============================================================================
// MockRotationMount - Simulated Rotation Mount
// =============================================================================

/// Mock rotation mount
///
/// Simulates a motorized rotation stage with:
/// - Travel limits (moves outside them fault)
/// - Optional finite speed (instantaneous by default)
/// - A log of every commanded position, for asserting "no motion happened"
///
/// # Example
///
/// ```rust,ignore
/// let mount = MockRotationMount::new(PositionBounds::new(0.0, 90.0)?);
/// mount.move_to(45.0).await?;
/// assert_eq!(mount.move_history().await, vec![45.0]);
/// ```
pub struct MockRotationMount {
    position: Arc<RwLock<f64>>,
    bounds: PositionBounds,
    speed_deg_per_sec: Option<f64>,
    moves: Mutex<Vec<f64>>,
    fault: Mutex<Option<String>>,
}

impl MockRotationMount {
    /// Create a mount resting at the lower travel limit
    pub fn new(bounds: PositionBounds) -> Self {
        Self::with_position(bounds, bounds.min)
    }

    /// Create a mount resting at `initial_position`
    pub fn with_position(bounds: PositionBounds, initial_position: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(bounds.clamp(initial_position))),
            bounds,
            speed_deg_per_sec: None,
            moves: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
        }
    }

    /// Give the mount a finite rotation speed
    pub fn with_speed(mut self, deg_per_sec: f64) -> Self {
        self.speed_deg_per_sec = Some(deg_per_sec).filter(|s| s.is_finite() && *s > 0.0);
        self
    }

    /// Shared handle to the simulated angle (used by `SimulatedPowerMeter`)
    pub fn position_handle(&self) -> Arc<RwLock<f64>> {
        Arc::clone(&self.position)
    }

    /// Every position commanded so far, in order
    pub async fn move_history(&self) -> Vec<f64> {
        self.moves.lock().await.clone()
    }

    /// Number of commanded moves
    pub async fn move_count(&self) -> usize {
        self.moves.lock().await.len()
    }

    /// Make subsequent moves fail with `ActuatorFault` (None clears the fault)
    pub async fn set_fault(&self, fault: Option<&str>) {
        *self.fault.lock().await = fault.map(str::to_string);
    }
}

#[async_trait]
impl RotationActuator for MockRotationMount {
    async fn move_to(&self, target: f64) -> AppResult<()> {
        if let Some(fault) = self.fault.lock().await.clone() {
            return Err(MonetError::ActuatorFault(fault));
        }
        if !target.is_finite() || !self.bounds.contains(target) {
            return Err(MonetError::ActuatorFault(format!(
                "Target {target:.3} deg outside travel range [{}, {}]",
                self.bounds.min, self.bounds.max
            )));
        }

        self.moves.lock().await.push(target);

        let current = *self.position.read().await;
        if let Some(speed) = self.speed_deg_per_sec {
            let delay = Duration::from_secs_f64((target - current).abs() / speed);
            tracing::debug!(from = current, to = target, ?delay, "MockRotationMount moving");
            sleep(delay).await;
        }

        *self.position.write().await = target;
        Ok(())
    }

    async fn current_position(&self) -> AppResult<f64> {
        Ok(*self.position.read().await)
    }

    fn bounds(&self) -> PositionBounds {
        self.bounds
    }
}

// =============================================================================
// Response models
// =============================================================================

/// Optical power transmitted by the attenuator as a function of mount angle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ResponseModel {
    /// `P = offset + slope * angle`
    Linear {
        /// Power at 0 deg (W)
        offset: f64,
        /// Power change per degree (W/deg)
        slope: f64,
    },
    /// Half-wave plate in front of a polarizer:
    /// `P = background + amplitude * (1 + sin(4*pi/180 * (angle + phase))) / 2`
    Sinusoid {
        /// Extinction floor (W)
        background: f64,
        /// Peak-to-peak modulation (W)
        amplitude: f64,
        /// Angular offset of the wave plate (deg)
        phase_deg: f64,
    },
    /// Piecewise-linear table of `(angle, power)` points, held flat outside its range
    Table {
        /// Points sorted by angle
        points: Vec<(f64, f64)>,
    },
}

impl ResponseModel {
    /// Noise-free power at `angle` degrees.
    pub fn power_at(&self, angle: f64) -> f64 {
        match self {
            ResponseModel::Linear { offset, slope } => offset + slope * angle,
            ResponseModel::Sinusoid {
                background,
                amplitude,
                phase_deg,
            } => {
                let phase = 4.0 * std::f64::consts::PI / 180.0 * (angle + phase_deg);
                background + amplitude * (1.0 + phase.sin()) / 2.0
            }
            ResponseModel::Table { points } => interpolate_table(points, angle),
        }
    }
}

fn interpolate_table(points: &[(f64, f64)], x: f64) -> f64 {
    match points {
        [] => 0.0,
        [(_, only)] => *only,
        [(x0, y0), ..] if x <= *x0 => *y0,
        [.., (xn, yn)] if x >= *xn => *yn,
        _ => points
            .windows(2)
            .find(|w| x >= w[0].0 && x <= w[1].0)
            .map(|w| {
                let (x0, y0) = w[0];
                let (x1, y1) = w[1];
                if x1 == x0 {
                    y0
                } else {
                    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
                }
            })
            .unwrap_or(0.0),
    }
}

// =============================================================================
// SimulatedPowerMeter
// =============================================================================

/// Simulated optical power meter
///
/// Reads the mount angle from a shared handle and returns the response model's
/// power plus Gaussian noise. Supports a wavelength range (outside it,
/// `set_wavelength_calibration` fails), an angular "dropout" window that returns
/// NaN (a blocked beam or saturated head), and a read budget after which every
/// read faults.
pub struct SimulatedPowerMeter {
    position: Arc<RwLock<f64>>,
    model: ResponseModel,
    noise_std: f64,
    wavelength_range_nm: (f64, f64),
    wavelength: RwLock<Option<Wavelength>>,
    dropout: Option<(f64, f64)>,
    fault_after_reads: Option<u64>,
    reads: AtomicU64,
}

impl SimulatedPowerMeter {
    /// Create a noise-free meter observing `position`
    pub fn new(position: Arc<RwLock<f64>>, model: ResponseModel) -> Self {
        Self {
            position,
            model,
            noise_std: 0.0,
            wavelength_range_nm: (400.0, 1100.0),
            wavelength: RwLock::new(None),
            dropout: None,
            fault_after_reads: None,
            reads: AtomicU64::new(0),
        }
    }

    /// Add zero-mean Gaussian noise with the given standard deviation (W)
    pub fn with_noise(mut self, noise_std: f64) -> Self {
        self.noise_std = noise_std.max(0.0);
        self
    }

    /// Restrict the supported detector wavelengths (nm, inclusive)
    pub fn with_wavelength_range(mut self, min_nm: f64, max_nm: f64) -> Self {
        self.wavelength_range_nm = (min_nm, max_nm);
        self
    }

    /// Return NaN for angles within `[from, to]`
    pub fn with_dropout(mut self, from: f64, to: f64) -> Self {
        self.dropout = Some((from, to));
        self
    }

    /// Fault every read after the first `reads` successful ones
    pub fn with_fault_after(mut self, reads: u64) -> Self {
        self.fault_after_reads = Some(reads);
        self
    }

    /// Total number of reads served (including faulted ones)
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Wavelength most recently selected, if any
    pub async fn wavelength(&self) -> Option<Wavelength> {
        *self.wavelength.read().await
    }

    fn gaussian(&self) -> f64 {
        if self.noise_std == 0.0 {
            return 0.0;
        }
        // Box-Muller
        let mut rng = rand::thread_rng();
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        self.noise_std * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

#[async_trait]
impl PowerSensor for SimulatedPowerMeter {
    async fn read(&self) -> AppResult<f64> {
        let count = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fault_after_reads.is_some_and(|limit| count >= limit) {
            return Err(MonetError::SensorFault(format!(
                "Simulated detector fault after {count} reads"
            )));
        }

        let angle = *self.position.read().await;
        if let Some((from, to)) = self.dropout {
            if angle >= from && angle <= to {
                return Ok(f64::NAN);
            }
        }

        Ok(self.model.power_at(angle) + self.gaussian())
    }

    async fn set_wavelength_calibration(&self, wavelength: Wavelength) -> AppResult<()> {
        let (min, max) = self.wavelength_range_nm;
        let nm = wavelength.nanometers();
        if nm < min || nm > max {
            return Err(MonetError::UnsupportedWavelength(nm));
        }
        *self.wavelength.write().await = Some(wavelength);
        Ok(())
    }
}

// =============================================================================
// Simulated rig configuration
// =============================================================================

/// Parameters of the simulated mount/meter pair used by the shell binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedRigConfig {
    /// Mount travel limits (deg)
    pub bounds: PositionBounds,
    /// Mount rotation speed (deg/s); `None` moves instantly
    pub speed_deg_per_sec: Option<f64>,
    /// Attenuator response
    pub response: ResponseModel,
    /// Meter noise standard deviation (W)
    pub noise_std: f64,
    /// Supported detector wavelengths (nm)
    pub wavelength_range_nm: (f64, f64),
}

impl Default for SimulatedRigConfig {
    fn default() -> Self {
        Self {
            bounds: PositionBounds::default(),
            speed_deg_per_sec: Some(180.0),
            response: ResponseModel::Sinusoid {
                background: 0.0,
                amplitude: 0.05,
                phase_deg: 30.0,
            },
            noise_std: 0.0,
            wavelength_range_nm: (400.0, 1100.0),
        }
    }
}

impl SimulatedRigConfig {
    /// Build the mount and the meter observing it.
    pub fn build(&self) -> AppResult<(MockRotationMount, SimulatedPowerMeter)> {
        let bounds = PositionBounds::new(self.bounds.min, self.bounds.max)?;
        let mut mount = MockRotationMount::new(bounds);
        if let Some(speed) = self.speed_deg_per_sec {
            mount = mount.with_speed(speed);
        }
        let (min_nm, max_nm) = self.wavelength_range_nm;
        let meter = SimulatedPowerMeter::new(mount.position_handle(), self.response.clone())
            .with_noise(self.noise_std)
            .with_wavelength_range(min_nm, max_nm);
        Ok((mount, meter))
    }
}
