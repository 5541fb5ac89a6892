//! Calibration data model
//!
//! - **`curve`**: `CalibrationSample`, `CalibrationCurve` and the inverse lookup
//!   used by the power controller
//! - **`fit`**: linear and wave plate model fits of a curve, for reporting
//! - **`store`**: `CalibrationStore`, the per-wavelength registry of curves and
//!   its JSON persistence
//!
//! Curves are produced by `procedures::power_calibration` and consumed by
//! `procedures::power_control`.

pub mod curve;
pub mod fit;
pub mod store;

pub use curve::{CalibrationCurve, CalibrationSample, InverseEstimate, Trend};
pub use fit::{fit_curve, FitModel, FitReport, ResponseFit};
pub use store::CalibrationStore;
