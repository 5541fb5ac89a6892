//! Session context for the interactive shell.
//!
//! A `SessionContext` owns everything a shell command needs: the device
//! handles, the calibration store, the selected wavelength and the curve the
//! power setter currently uses. It is an explicit object handed to the shell,
//! never a global.
//!
//! ## States
//!
//! ```text
//! Unconfigured --config--> Configured --calibrate--> Calibrated
//!                              ^                         |
//!                              +------config (new nm)----+
//! ```
//!
//! - **`config`** selects the wavelength on the power meter first; if the meter
//!   rejects it nothing changes. Otherwise the active curve is dropped and, when
//!   `reattach_stored_curve` is on and the store already holds a curve for that
//!   wavelength, that curve is attached straight away.
//! - **`calibrate`** runs a sweep and commits the curve to the store (and the
//!   store file). A failed sweep leaves the store and active curve untouched.
//! - **`set`** drives the attenuator to a power using the active curve.
//! - **`reload`** re-reads the store file and re-attaches the current
//!   wavelength's curve.
//!
//! Every command clears the abort signal when it starts.

use crate::calibration::{fit_curve, CalibrationCurve, CalibrationStore, FitModel, FitReport};
use crate::config::MonetConfig;
use crate::error::{AppResult, MonetError};
use crate::hardware::{PowerSensor, RotationActuator};
use crate::procedures::{
    build_curve, set_power_with_curve, AbortSignal, ControlParams, ConvergenceResult,
    DeviceTimeouts, SweepConfig,
};
use crate::types::{format_power, Wavelength};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where the session is in its configure/calibrate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No wavelength selected
    Unconfigured,
    /// Wavelength selected, no active curve
    Configured,
    /// Wavelength selected and a curve attached
    Calibrated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configured => "configured",
            SessionState::Calibrated => "calibrated",
        };
        f.write_str(name)
    }
}

/// Defaults and policies a session runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Sweep used by `calibrate` when no override is given
    pub sweep: SweepConfig,
    /// Control loop parameters used by `set`
    pub control: ControlParams,
    /// Device I/O timeouts
    pub timeouts: DeviceTimeouts,
    /// Attach a stored curve when its wavelength is selected
    pub reattach_stored_curve: bool,
    /// Model fitted to the active curve when reporting status
    pub fit_model: FitModel,
    /// Store file written after each calibration (`None` keeps curves in memory only)
    pub store_path: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&MonetConfig::default())
    }
}

impl SessionSettings {
    /// Extract the session settings from the application configuration.
    pub fn from_config(config: &MonetConfig) -> Self {
        Self {
            sweep: config.sweep.clone(),
            control: config.control.clone(),
            timeouts: config.devices.timeouts,
            reattach_stored_curve: config.session.reattach_stored_curve,
            fit_model: config.session.fit_model,
            store_path: config.store.persist.then(|| config.store.path.clone()),
        }
    }
}

/// Per-command adjustments of the control parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlOverrides {
    /// Accepted power error (W)
    pub tolerance: Option<f64>,
    /// Iteration budget
    pub max_iterations: Option<usize>,
    /// Time budget
    pub max_duration: Option<Duration>,
}

impl ControlOverrides {
    /// `base` with every given override applied.
    pub fn apply(&self, base: &ControlParams) -> ControlParams {
        ControlParams {
            tolerance: self.tolerance.unwrap_or(base.tolerance),
            max_iterations: self.max_iterations.unwrap_or(base.max_iterations),
            max_duration: self.max_duration.unwrap_or(base.max_duration),
            ..base.clone()
        }
    }
}

/// Summary of the active curve.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveSummary {
    /// Number of samples
    pub samples: usize,
    /// `(first, last)` calibrated position
    pub position_range: (f64, f64),
    /// `(min, max)` calibrated power (W)
    pub power_range: (f64, f64),
    /// Whether the curve was flagged non-monotonic
    pub non_monotonic: bool,
    /// When the sweep ran
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Model fitted to the samples, if one was requested and could be fitted
    pub fit: Option<FitReport>,
}

impl CurveSummary {
    /// Summarize `curve`, fitting `fit_model` to its samples.
    pub fn new(curve: &CalibrationCurve, fit_model: FitModel) -> Self {
        let fit = fit_curve(curve, fit_model).unwrap_or_else(|e| {
            tracing::debug!(?fit_model, error = %e, "Curve fit unavailable");
            None
        });
        Self {
            samples: curve.len(),
            position_range: curve.position_range(),
            power_range: curve.power_range(),
            non_monotonic: curve.is_non_monotonic(),
            created_at: curve.created_at(),
            fit,
        }
    }
}

/// Snapshot returned by `SessionContext::status`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    /// Lifecycle state
    pub state: SessionState,
    /// Selected wavelength
    pub wavelength: Option<Wavelength>,
    /// Active curve, if any
    pub curve: Option<CurveSummary>,
    /// Actuator position, if the actuator answered
    pub actuator_position: Option<f64>,
    /// Every wavelength with a stored curve
    pub stored_wavelengths: Vec<Wavelength>,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State:       {}", self.state)?;
        match self.wavelength {
            Some(w) => writeln!(f, "Wavelength:  {w} nm")?,
            None => writeln!(f, "Wavelength:  (none)")?,
        }
        match &self.curve {
            Some(curve) => {
                let (first, last) = curve.position_range;
                let (min, max) = curve.power_range;
                writeln!(
                    f,
                    "Curve:       {} samples, {first:.2}..{last:.2} deg, {} .. {}{}",
                    curve.samples,
                    format_power(min),
                    format_power(max),
                    if curve.non_monotonic {
                        " (non-monotonic)"
                    } else {
                        ""
                    }
                )?;
                writeln!(f, "Calibrated:  {}", curve.created_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
                if let Some(fit) = &curve.fit {
                    writeln!(f, "Fit:         {fit}")?;
                }
            }
            None => writeln!(f, "Curve:       (none)")?,
        }
        match self.actuator_position {
            Some(p) => writeln!(f, "Actuator:    {p:.3} deg")?,
            None => writeln!(f, "Actuator:    (unavailable)")?,
        }
        let stored: Vec<String> = self
            .stored_wavelengths
            .iter()
            .map(|w| format!("{w} nm"))
            .collect();
        write!(
            f,
            "Stored:      {}",
            if stored.is_empty() {
                "(none)".to_string()
            } else {
                stored.join(", ")
            }
        )
    }
}

/// State shared by every shell command.
pub struct SessionContext {
    actuator: Arc<dyn RotationActuator>,
    sensor: Arc<dyn PowerSensor>,
    store: CalibrationStore,
    settings: SessionSettings,
    wavelength: Option<Wavelength>,
    active_curve: Option<Arc<CalibrationCurve>>,
    abort: AbortSignal,
}

impl SessionContext {
    /// Create an unconfigured session.
    pub fn new(
        actuator: Arc<dyn RotationActuator>,
        sensor: Arc<dyn PowerSensor>,
        store: CalibrationStore,
        settings: SessionSettings,
    ) -> Self {
        Self {
            actuator,
            sensor,
            store,
            settings,
            wavelength: None,
            active_curve: None,
            abort: AbortSignal::new(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        match (self.wavelength, &self.active_curve) {
            (None, _) => SessionState::Unconfigured,
            (Some(_), None) => SessionState::Configured,
            (Some(_), Some(_)) => SessionState::Calibrated,
        }
    }

    /// Selected wavelength
    pub fn wavelength(&self) -> Option<Wavelength> {
        self.wavelength
    }

    /// Curve used by `set`
    pub fn active_curve(&self) -> Option<Arc<CalibrationCurve>> {
        self.active_curve.clone()
    }

    /// Calibration store
    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    /// Session defaults and policies
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Handle for requesting an abort of the running command (e.g. from Ctrl+C)
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Select the working wavelength.
    pub async fn config(&mut self, wavelength: Wavelength) -> AppResult<SessionState> {
        self.abort.reset();

        let read_timeout = self.settings.timeouts.read_timeout;
        tokio::time::timeout(
            read_timeout,
            self.sensor.set_wavelength_calibration(wavelength),
        )
        .await
        .map_err(|_| {
            MonetError::SensorFault(format!(
                "Wavelength selection timed out after {read_timeout:?}"
            ))
        })??;

        self.wavelength = Some(wavelength);
        self.active_curve = None;
        if self.settings.reattach_stored_curve && self.store.has(wavelength) {
            self.active_curve = Some(self.store.get(wavelength)?);
        }

        let state = self.state();
        tracing::info!(wavelength_nm = wavelength.nanometers(), %state, "Wavelength selected");
        Ok(state)
    }

    /// Run a calibration sweep for the selected wavelength and commit it.
    ///
    /// If the sweep succeeds but the store file cannot be written, the new
    /// curve stays committed in memory and active; the write error is returned.
    pub async fn calibrate(
        &mut self,
        sweep: Option<SweepConfig>,
    ) -> AppResult<Arc<CalibrationCurve>> {
        self.abort.reset();
        let wavelength = self.wavelength.ok_or(MonetError::NotConfigured)?;
        let sweep = sweep.unwrap_or_else(|| self.settings.sweep.clone());

        let curve = match build_curve(
            wavelength,
            self.actuator.as_ref(),
            self.sensor.as_ref(),
            &sweep,
            &self.settings.timeouts,
            &self.abort,
        )
        .await
        {
            Ok(curve) => curve,
            Err(e) => {
                self.report_failure("calibrate", &e).await;
                return Err(e);
            }
        };

        self.store.put(wavelength, curve)?;
        let committed = self.store.get(wavelength)?;
        self.active_curve = Some(Arc::clone(&committed));

        if let Some(path) = &self.settings.store_path {
            if let Err(e) = self.store.save(path) {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Calibration kept in memory but the store file was not written"
                );
                return Err(e);
            }
        }

        Ok(committed)
    }

    /// Drive the attenuator to `target` watts using the active curve.
    pub async fn set(
        &mut self,
        target: f64,
        overrides: ControlOverrides,
    ) -> AppResult<ConvergenceResult> {
        self.abort.reset();
        let wavelength = self.wavelength.ok_or(MonetError::NotConfigured)?;
        let curve = self
            .active_curve
            .clone()
            .ok_or(MonetError::NotCalibrated {
                wavelength: wavelength.nanometers(),
            })?;
        let params = overrides.apply(&self.settings.control);

        let result = set_power_with_curve(
            &curve,
            target,
            self.actuator.as_ref(),
            self.sensor.as_ref(),
            &params,
            &self.settings.timeouts,
            &self.abort,
        )
        .await;

        if let Err(e) = &result {
            self.report_failure("set", e).await;
        }
        result
    }

    /// Re-read the store file and re-attach the curve for the selected wavelength.
    ///
    /// Returns the number of curves loaded.
    pub async fn reload(&mut self) -> AppResult<usize> {
        self.abort.reset();
        let path = self.settings.store_path.clone().ok_or_else(|| {
            MonetError::Configuration("No calibration store file is configured".to_string())
        })?;

        self.store = CalibrationStore::load(&path)?;
        self.active_curve = self
            .wavelength
            .filter(|w| self.store.has(*w))
            .and_then(|w| self.store.get(w).ok());

        tracing::info!(
            path = %path.display(),
            curves = self.store.len(),
            state = %self.state(),
            "Calibration store reloaded"
        );
        Ok(self.store.len())
    }

    /// Snapshot of the session and the actuator.
    pub async fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            wavelength: self.wavelength,
            curve: self
                .active_curve
                .as_deref()
                .map(|curve| CurveSummary::new(curve, self.settings.fit_model)),
            actuator_position: self.actuator.current_position().await.ok(),
            stored_wavelengths: self.store.wavelengths(),
        }
    }

    async fn report_failure(&self, command: &str, error: &MonetError) {
        let moved = error.is_device_fault()
            || matches!(
                error,
                MonetError::Aborted { .. } | MonetError::ConvergenceFailed { .. }
            );
        if !moved {
            return;
        }
        match self.actuator.current_position().await {
            Ok(position) => tracing::warn!(command, %error, position, "Command stopped"),
            Err(query) => {
                tracing::warn!(command, %error, %query, "Command stopped; actuator position unknown")
            }
        }
    }
}
