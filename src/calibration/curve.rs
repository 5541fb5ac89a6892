//! Calibration curves: sampled position -> power mappings for one wavelength.

use crate::error::{AppResult, MonetError};
use crate::types::Wavelength;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Positions closer than this are treated as the same inverse-lookup candidate.
const POSITION_EPSILON: f64 = 1e-9;

/// One averaged power reading taken during a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    /// Actuator position (deg)
    pub position: f64,
    /// Mean measured power (W)
    pub power: f64,
    /// When the reading was taken
    pub recorded_at: DateTime<Utc>,
}

impl CalibrationSample {
    /// Sample stamped with the current time
    pub fn now(position: f64, power: f64) -> Self {
        Self {
            position,
            power,
            recorded_at: Utc::now(),
        }
    }
}

/// Dominant direction of power change with increasing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Power grows with position
    Increasing,
    /// Power falls with position
    Decreasing,
}

/// Result of an inverse lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct InverseEstimate {
    /// Interpolated position expected to yield the target power
    pub position: f64,
    /// Indices of the two samples bracketing the target
    pub bracket: (usize, usize),
    /// Power slope of the bracket (W/deg)
    pub slope: f64,
    /// Number of distinct candidate positions found
    pub candidates: usize,
    /// Whether several distinct positions on a flagged curve match the target
    pub ambiguous: bool,
}

/// Empirical mapping from actuator position to optical power for one wavelength.
///
/// Invariants (enforced by every constructor, including deserialization):
/// at least two samples, finite non-negative powers, strictly increasing
/// positions, and a non-degenerate power range. A curve never changes after
/// construction; recalibration builds a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CurveRecord", into = "CurveRecord")]
pub struct CalibrationCurve {
    wavelength: Wavelength,
    samples: Vec<CalibrationSample>,
    created_at: DateTime<Utc>,
    non_monotonic: bool,
    trend: Trend,
    min_power: f64,
    max_power: f64,
}

/// On-disk shape of a curve. Derived state is recomputed on load; the
/// non-monotonic flag is stored because its threshold is a sweep setting.
#[derive(Serialize, Deserialize)]
struct CurveRecord {
    wavelength_nm: Wavelength,
    created_at: DateTime<Utc>,
    non_monotonic: bool,
    samples: Vec<CalibrationSample>,
}

impl TryFrom<CurveRecord> for CalibrationCurve {
    type Error = MonetError;

    fn try_from(record: CurveRecord) -> Result<Self, Self::Error> {
        Self::from_parts(
            record.wavelength_nm,
            record.samples,
            record.created_at,
            record.non_monotonic,
        )
    }
}

impl From<CalibrationCurve> for CurveRecord {
    fn from(curve: CalibrationCurve) -> Self {
        Self {
            wavelength_nm: curve.wavelength,
            created_at: curve.created_at,
            non_monotonic: curve.non_monotonic,
            samples: curve.samples,
        }
    }
}

impl CalibrationCurve {
    /// Build a curve from sweep samples, flagging steps that go against the
    /// dominant trend by more than `monotonic_tolerance` times the power span.
    pub fn from_samples(
        wavelength: Wavelength,
        samples: Vec<CalibrationSample>,
        monotonic_tolerance: f64,
    ) -> AppResult<Self> {
        let mut curve = Self::from_parts(wavelength, samples, Utc::now(), false)?;
        curve.non_monotonic = curve.detect_non_monotonic(monotonic_tolerance);
        Ok(curve)
    }

    /// Rebuild a curve with a known flag (used when loading from disk).
    pub fn from_parts(
        wavelength: Wavelength,
        samples: Vec<CalibrationSample>,
        created_at: DateTime<Utc>,
        non_monotonic: bool,
    ) -> AppResult<Self> {
        if samples.len() < 2 {
            return Err(MonetError::InsufficientCalibrationData(format!(
                "{} valid sample(s), at least 2 required",
                samples.len()
            )));
        }
        if let Some(bad) = samples
            .iter()
            .find(|s| !s.position.is_finite() || !s.power.is_finite() || s.power < 0.0)
        {
            return Err(MonetError::Configuration(format!(
                "Invalid calibration sample (position {}, power {})",
                bad.position, bad.power
            )));
        }
        if samples.windows(2).any(|w| w[1].position <= w[0].position) {
            return Err(MonetError::Configuration(
                "Calibration positions must be strictly increasing".to_string(),
            ));
        }

        let (min_power, max_power) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s.power), hi.max(s.power))
            });
        if max_power == min_power {
            return Err(MonetError::InsufficientCalibrationData(format!(
                "All samples read {min_power:.6e} W; the attenuator has no effect over this range"
            )));
        }

        let (rise, fall) = samples.windows(2).fold((0.0, 0.0), |(rise, fall), w| {
            let delta = w[1].power - w[0].power;
            if delta > 0.0 {
                (rise + delta, fall)
            } else {
                (rise, fall - delta)
            }
        });
        let trend = if rise >= fall {
            Trend::Increasing
        } else {
            Trend::Decreasing
        };

        Ok(Self {
            wavelength,
            samples,
            created_at,
            non_monotonic,
            trend,
            min_power,
            max_power,
        })
    }

    fn detect_non_monotonic(&self, tolerance: f64) -> bool {
        let threshold = tolerance.max(0.0) * (self.max_power - self.min_power);
        self.samples.windows(2).any(|w| {
            let delta = w[1].power - w[0].power;
            let against = match self.trend {
                Trend::Increasing => -delta,
                Trend::Decreasing => delta,
            };
            against > threshold
        })
    }

    /// Wavelength this curve was measured at
    pub fn wavelength(&self) -> Wavelength {
        self.wavelength
    }

    /// Samples in ascending position order
    pub fn samples(&self) -> &[CalibrationSample] {
        &self.samples
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false; curves hold at least two samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Creation time of the curve
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Dominant trend of power with position
    pub fn trend(&self) -> Trend {
        self.trend
    }

    /// Whether the sweep contained steps against the trend beyond the noise threshold
    pub fn is_non_monotonic(&self) -> bool {
        self.non_monotonic
    }

    /// `(min, max)` measured power
    pub fn power_range(&self) -> (f64, f64) {
        (self.min_power, self.max_power)
    }

    /// `(first, last)` sampled position
    pub fn position_range(&self) -> (f64, f64) {
        (self.samples[0].position, self.samples[self.samples.len() - 1].position)
    }

    /// Whether `power` lies within the measured power range
    pub fn covers(&self, power: f64) -> bool {
        power >= self.min_power && power <= self.max_power
    }

    /// Interpolated power at `position` (held flat outside the sampled range)
    pub fn power_at(&self, position: f64) -> f64 {
        let k = self.segment_index(position);
        let (a, b) = (&self.samples[k], &self.samples[k + 1]);
        let x = position.clamp(self.samples[0].position, self.samples[self.len() - 1].position);
        a.power + (x - a.position) * (b.power - a.power) / (b.position - a.position)
    }

    fn segment_index(&self, position: f64) -> usize {
        let last_segment = self.samples.len() - 2;
        self.samples
            .windows(2)
            .position(|w| position < w[1].position)
            .unwrap_or(last_segment)
            .min(last_segment)
    }

    fn segment_slope(&self, k: usize) -> f64 {
        let (a, b) = (&self.samples[k], &self.samples[k + 1]);
        (b.power - a.power) / (b.position - a.position)
    }

    /// Power slope (W/deg) of the segment containing `position`.
    ///
    /// Flat segments borrow the slope of the nearest non-flat one, so the result
    /// is never zero.
    pub fn local_slope(&self, position: f64) -> f64 {
        let k = self.segment_index(position);
        let segments = self.samples.len() - 1;
        (0..segments)
            .flat_map(|d| [k.checked_sub(d), Some(k + d).filter(|&i| i < segments)])
            .flatten()
            .map(|i| self.segment_slope(i))
            .find(|s| *s != 0.0)
            .unwrap_or_else(|| {
                let (first, last) = self.position_range();
                (self.max_power - self.min_power) / (last - first)
            })
    }

    /// Estimate the position that yields `target` watts.
    ///
    /// Every pair of consecutive samples whose powers span the target gives a
    /// candidate by linear interpolation. The candidate nearest
    /// `current_position` wins (ties go to the lower position), which is also the
    /// unique answer on a monotonic curve.
    pub fn inverse_lookup(&self, target: f64, current_position: f64) -> AppResult<InverseEstimate> {
        if !target.is_finite() || !self.covers(target) {
            return Err(MonetError::TargetOutOfRange {
                target,
                min: self.min_power,
                max: self.max_power,
            });
        }

        let mut candidates: Vec<(f64, usize, f64)> = Vec::new();
        for (k, w) in self.samples.windows(2).enumerate() {
            let (a, b) = (&w[0], &w[1]);
            if target < a.power.min(b.power) || target > a.power.max(b.power) {
                continue;
            }
            let slope = (b.power - a.power) / (b.position - a.position);
            let position = if b.power == a.power {
                a.position
            } else {
                a.position + (target - a.power) / slope
            };
            if candidates
                .iter()
                .all(|(p, _, _)| (p - position).abs() > POSITION_EPSILON)
            {
                candidates.push((position, k, slope));
            }
        }

        let distinct = candidates.len();
        let (position, k, slope) = candidates
            .into_iter()
            .min_by(|x, y| {
                let dx = (x.0 - current_position).abs();
                let dy = (y.0 - current_position).abs();
                dx.total_cmp(&dy).then(x.0.total_cmp(&y.0))
            })
            .ok_or(MonetError::TargetOutOfRange {
                target,
                min: self.min_power,
                max: self.max_power,
            })?;

        Ok(InverseEstimate {
            position,
            bracket: (k, k + 1),
            slope,
            candidates: distinct,
            ambiguous: self.non_monotonic && distinct > 1,
        })
    }
}
