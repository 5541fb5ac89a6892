//! Model fits of calibration curves.
//!
//! A half-wave plate in front of a polarizer transmits
//! `P(x) = background + amplitude * (1 + sin(4*pi/180 * (x + phase))) / 2`,
//! which repeats every 90 deg. Other attenuators are often close to linear
//! over the swept range. With the period fixed both models are linear in
//! their coefficients, so each fit is a small least-squares solve.
//!
//! Fits are derived from the samples on demand and never persisted.

use super::curve::CalibrationCurve;
use crate::error::{AppResult, MonetError};
use crate::types::format_power;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Angular frequency of the wave plate response (rad/deg).
const WAVE_PLATE_RAD_PER_DEG: f64 = 4.0 * std::f64::consts::PI / 180.0;

/// Period of the wave plate response (deg).
const WAVE_PLATE_PERIOD: f64 = 90.0;

/// Model fitted to a curve for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitModel {
    /// No fit
    None,
    /// `offset + slope * x`
    Linear,
    /// Half-wave plate and polarizer
    #[default]
    Sinusoid,
}

/// Fitted model parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseFit {
    /// `P = offset + slope * x`
    Linear {
        /// Power at 0 deg (W)
        offset: f64,
        /// W per deg
        slope: f64,
    },
    /// `P = background + amplitude * (1 + sin(4*pi/180 * (x + phase_deg))) / 2`
    Sinusoid {
        /// Power at extinction (W)
        background: f64,
        /// Peak-to-peak modulation (W)
        amplitude: f64,
        /// Wave plate offset, in `[0, 90)` deg
        phase_deg: f64,
    },
}

impl ResponseFit {
    /// Power the model predicts at `position` degrees.
    pub fn power_at(&self, position: f64) -> f64 {
        match *self {
            ResponseFit::Linear { offset, slope } => offset + slope * position,
            ResponseFit::Sinusoid {
                background,
                amplitude,
                phase_deg,
            } => {
                let phase = WAVE_PLATE_RAD_PER_DEG * (position + phase_deg);
                background + amplitude * (1.0 + phase.sin()) / 2.0
            }
        }
    }
}

impl fmt::Display for ResponseFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ResponseFit::Linear { offset, slope } => write!(
                f,
                "linear, {} + {}/deg",
                format_power(offset),
                format_power(slope)
            ),
            ResponseFit::Sinusoid {
                background,
                amplitude,
                phase_deg,
            } => write!(
                f,
                "sinusoid, background {}, amplitude {}, phase {phase_deg:.2} deg",
                format_power(background),
                format_power(amplitude)
            ),
        }
    }
}

/// A fit and how well it matches the samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    /// Fitted parameters
    pub model: ResponseFit,
    /// Root mean square of the residuals (W)
    pub rms_residual: f64,
}

impl fmt::Display for FitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rms {})", self.model, format_power(self.rms_residual))
    }
}

/// Fit `model` to `curve`. `FitModel::None` yields `Ok(None)`.
pub fn fit_curve(curve: &CalibrationCurve, model: FitModel) -> AppResult<Option<FitReport>> {
    match model {
        FitModel::None => Ok(None),
        FitModel::Linear => fit_linear(curve).map(Some),
        FitModel::Sinusoid => fit_sinusoid(curve).map(Some),
    }
}

/// Least-squares straight line through the samples.
pub fn fit_linear(curve: &CalibrationCurve) -> AppResult<FitReport> {
    let [offset, slope] = least_squares(curve, |x| [1.0, x])?;
    Ok(report(curve, ResponseFit::Linear { offset, slope }))
}

/// Least-squares wave plate response through the samples.
pub fn fit_sinusoid(curve: &CalibrationCurve) -> AppResult<FitReport> {
    let [mean, b, c] = least_squares(curve, |x| {
        let phase = WAVE_PLATE_RAD_PER_DEG * x;
        [1.0, phase.sin(), phase.cos()]
    })?;

    // b*sin(kx) + c*cos(kx) = r*sin(kx + theta)
    let r = b.hypot(c);
    let theta = c.atan2(b);
    let model = ResponseFit::Sinusoid {
        background: mean - r,
        amplitude: 2.0 * r,
        phase_deg: (theta / WAVE_PLATE_RAD_PER_DEG).rem_euclid(WAVE_PLATE_PERIOD),
    };
    Ok(report(curve, model))
}

fn report(curve: &CalibrationCurve, model: ResponseFit) -> FitReport {
    let samples = curve.samples();
    let sum_sq: f64 = samples
        .iter()
        .map(|s| (s.power - model.power_at(s.position)).powi(2))
        .sum();
    FitReport {
        model,
        rms_residual: (sum_sq / samples.len() as f64).sqrt(),
    }
}

/// Solve the normal equations for the coefficients of `basis`.
fn least_squares<const P: usize>(
    curve: &CalibrationCurve,
    basis: impl Fn(f64) -> [f64; P],
) -> AppResult<[f64; P]> {
    let samples = curve.samples();
    if samples.len() < P {
        return Err(MonetError::InsufficientCalibrationData(format!(
            "{} sample(s) cannot determine {P} fit parameters",
            samples.len()
        )));
    }

    let mut normal = [[0.0; P]; P];
    let mut rhs = [0.0; P];
    for sample in samples {
        let row = basis(sample.position);
        for i in 0..P {
            rhs[i] += row[i] * sample.power;
            for j in 0..P {
                normal[i][j] += row[i] * row[j];
            }
        }
    }

    solve(normal, rhs).ok_or_else(|| {
        MonetError::InsufficientCalibrationData(
            "Sample positions do not determine the fit".to_string(),
        )
    })
}

/// Gaussian elimination with partial pivoting. `None` when singular.
fn solve<const P: usize>(mut a: [[f64; P]; P], mut b: [f64; P]) -> Option<[f64; P]> {
    let scale = a
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].abs())
        .fold(0.0, f64::max);
    if scale == 0.0 {
        return None;
    }

    for col in 0..P {
        let pivot = (col..P).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() <= scale * 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..P {
            let factor = a[row][col] / a[col][col];
            for k in col..P {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; P];
    for row in (0..P).rev() {
        let tail: f64 = (row + 1..P).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationSample;
    use crate::types::Wavelength;

    fn curve_from(positions: impl Iterator<Item = f64>, power: impl Fn(f64) -> f64) -> CalibrationCurve {
        let samples = positions
            .map(|x| CalibrationSample::now(x, power(x)))
            .collect();
        CalibrationCurve::from_samples(Wavelength::new(561.0).unwrap(), samples, 0.02).unwrap()
    }

    #[test]
    fn recovers_wave_plate_parameters() {
        let truth = ResponseFit::Sinusoid {
            background: 0.4e-3,
            amplitude: 50e-3,
            phase_deg: 30.0,
        };
        let curve = curve_from((0..19).map(|i| i as f64 * 5.0), |x| truth.power_at(x));

        let fit = fit_sinusoid(&curve).unwrap();
        match fit.model {
            ResponseFit::Sinusoid {
                background,
                amplitude,
                phase_deg,
            } => {
                assert!((background - 0.4e-3).abs() < 1e-9);
                assert!((amplitude - 50e-3).abs() < 1e-9);
                assert!((phase_deg - 30.0).abs() < 1e-6);
            }
            other => panic!("unexpected model {other:?}"),
        }
        assert!(fit.rms_residual < 1e-12);
    }

    #[test]
    fn phase_is_reported_within_one_period() {
        // -10 deg and 80 deg describe the same response
        let truth = ResponseFit::Sinusoid {
            background: 0.0,
            amplitude: 10e-3,
            phase_deg: -10.0,
        };
        let curve = curve_from((0..10).map(|i| 30.0 + i as f64 * 7.0), |x| truth.power_at(x));
        match fit_sinusoid(&curve).unwrap().model {
            ResponseFit::Sinusoid { phase_deg, .. } => assert!((phase_deg - 80.0).abs() < 1e-6),
            other => panic!("unexpected model {other:?}"),
        }
    }

    #[test]
    fn recovers_line() {
        let curve = curve_from((0..10).map(|i| 0.1 + 7.3 * i as f64), |x| 2e-4 + 1e-4 * x);
        let fit = fit_linear(&curve).unwrap();
        let ResponseFit::Linear { offset, slope } = fit.model else {
            panic!("expected a line");
        };
        assert!((offset - 2e-4).abs() < 1e-12);
        assert!((slope - 1e-4).abs() < 1e-12);
        assert!(fit.rms_residual < 1e-12);
    }

    #[test]
    fn wrong_model_leaves_residual() {
        // A quarter period of the wave plate response is far from a line
        let truth = ResponseFit::Sinusoid {
            background: 0.0,
            amplitude: 50e-3,
            phase_deg: 0.0,
        };
        let curve = curve_from((0..19).map(|i| i as f64 * 5.0), |x| truth.power_at(x));
        let line = fit_linear(&curve).unwrap();
        let wave = fit_sinusoid(&curve).unwrap();
        assert!(line.rms_residual > 1e-3);
        assert!(wave.rms_residual < line.rms_residual);
    }

    #[test]
    fn too_few_samples_for_sinusoid() {
        let curve = curve_from([0.0, 45.0].into_iter(), |x| 1e-4 * x);
        assert!(matches!(
            fit_sinusoid(&curve),
            Err(MonetError::InsufficientCalibrationData(_))
        ));
        assert!(fit_linear(&curve).is_ok());
    }

    #[test]
    fn aliased_positions_are_degenerate() {
        // Every sample sits at the same wave plate phase
        let curve = curve_from([0.0, 90.0, 180.0].into_iter(), |x| 1e-3 + 1e-6 * x);
        assert!(fit_sinusoid(&curve).is_err());
    }

    #[test]
    fn no_model_requested() {
        let curve = curve_from((0..5).map(|i| i as f64 * 10.0), |x| 1e-4 * x);
        assert_eq!(fit_curve(&curve, FitModel::None).unwrap(), None);
        assert!(fit_curve(&curve, FitModel::Sinusoid).unwrap().is_some());
    }

    #[test]
    fn display_names_the_model() {
        let fit = FitReport {
            model: ResponseFit::Sinusoid {
                background: 0.0,
                amplitude: 50e-3,
                phase_deg: 30.0,
            },
            rms_residual: 1e-6,
        };
        let text = fit.to_string();
        assert!(text.starts_with("sinusoid"));
        assert!(text.contains("50.0000 mW"));
        assert!(text.contains("30.00 deg"));
    }
}
