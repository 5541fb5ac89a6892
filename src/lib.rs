//! # Monet
//!
//! Wavelength-resolved laser power calibration and closed-loop power setting
//! through a motorized attenuator (a rotation mount turning a wave plate in
//! front of a polarizer) and an optical power meter.
//!
//! ## Crate Structure
//!
//! - **`calibration`**: calibration curves (position -> power), inverse lookup
//!   and the per-wavelength calibration store with JSON persistence.
//! - **`config`**: Figment-based configuration (defaults, TOML file, `MONET_`
//!   environment variables).
//! - **`error`**: the `MonetError` enum and `AppResult` alias.
//! - **`hardware`**: `RotationActuator` and `PowerSensor` capability traits and
//!   the simulated rig.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`procedures`**: calibration sweep, power control loop, abort signal.
//! - **`session`**: the session context and its configure/calibrate/set lifecycle.
//! - **`shell`**: command parsing and execution for the interactive shell.
//! - **`types`**: wavelength and position bound types, power parsing/formatting.

pub mod calibration;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod procedures;
pub mod session;
pub mod shell;
pub mod types;
