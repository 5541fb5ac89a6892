//! Calibration and control procedures
//!
//! Long-running operations that drive the attenuator and read the power meter:
//!
//! - **`power_calibration`**: sweeps the attenuator and builds a
//!   `CalibrationCurve` for one wavelength
//! - **`power_control`**: closed-loop power setting against a curve
//! - **`acquisition`**: the timeout-bounded move/settle/read primitives both
//!   are built from
//! - **`abort`**: the shared flag that stops a running procedure between steps
//!
//! # Execution model
//!
//! Procedures run one at a time and await every device call in sequence. The
//! only suspension points are device I/O and settle delays. An abort is
//! honoured before the next move; the actuator is left where it was last
//! commanded.

pub mod abort;
pub mod acquisition;
pub mod power_calibration;
pub mod power_control;

pub use abort::AbortSignal;
pub use acquisition::{averaged_read, move_and_settle, DeviceTimeouts};
pub use power_calibration::{build_curve, SweepConfig, SweepResolution};
pub use power_control::{set_power, set_power_with_curve, ControlParams, ConvergenceResult};
