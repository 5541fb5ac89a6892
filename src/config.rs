//! Configuration loading using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. A TOML file (`config/monet.toml` unless another path is given)
//! 3. Environment variables prefixed with `MONET_`, with `__` separating
//!    nested keys
//!
//! # Example
//! ```no_run
//! use monet::config::MonetConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // MONET_CONTROL__TOLERANCE=0.00005 MONET_APPLICATION__LOG_LEVEL=debug
//! let config = MonetConfig::load()?;
//! config.validate()?;
//! println!("Store: {}", config.store.path.display());
//! # Ok(())
//! # }
//! ```

use crate::calibration::FitModel;
use crate::error::{AppResult, MonetError};
use crate::hardware::SimulatedRigConfig;
use crate::logging::OutputFormat;
use crate::procedures::{ControlParams, DeviceTimeouts, SweepConfig};
use crate::types::PositionBounds;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/monet.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "MONET_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonetConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Calibration store persistence
    pub store: StoreConfig,
    /// Default calibration sweep
    pub sweep: SweepConfig,
    /// Default power control loop parameters
    pub control: ControlParams,
    /// Device I/O and simulated rig
    pub devices: DevicesConfig,
    /// Session behaviour
    pub session: SessionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Monet".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Calibration store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding every calibration curve
    pub path: PathBuf,
    /// Write the store back after each successful calibration
    pub persist: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            persist: true,
        }
    }
}

/// `<data dir>/monet/calibrations.json`, or the working directory when the
/// platform has no data directory.
fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("monet"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("calibrations.json")
}

/// Device configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Per-operation I/O timeouts
    pub timeouts: DeviceTimeouts,
    /// Simulated mount and power meter
    pub simulation: SimulatedRigConfig,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Attach the stored curve automatically when a calibrated wavelength is selected
    pub reattach_stored_curve: bool,
    /// Model fitted to the active curve in `status`
    pub fit_model: FitModel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reattach_stored_curve: true,
            fit_model: FitModel::Sinusoid,
        }
    }
}

impl MonetConfig {
    /// Load configuration from `config/monet.toml` and environment variables
    ///
    /// Example override: `MONET_SWEEP__AVERAGES=5`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file is not an
    /// error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack used by `load_from`.
    ///
    /// Defaults come from the `#[serde(default)]` attributes, so an enum-valued
    /// setting given in the file (sweep resolution, response model) replaces the
    /// default as a whole.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        crate::logging::parse_log_level(&self.application.log_level)
            .map_err(MonetError::Configuration)?;

        let rig = &self.devices.simulation;
        let bounds = PositionBounds::new(rig.bounds.min, rig.bounds.max)?;
        self.sweep
            .validate(bounds)
            .map_err(|e| MonetError::Configuration(format!("[sweep] {e}")))?;
        self.control
            .validate()
            .map_err(|e| MonetError::Configuration(format!("[control] {e}")))?;

        let timeouts = &self.devices.timeouts;
        if timeouts.move_timeout.is_zero() || timeouts.read_timeout.is_zero() {
            return Err(MonetError::Configuration(
                "Device timeouts must be greater than zero".to_string(),
            ));
        }

        let (min_nm, max_nm) = rig.wavelength_range_nm;
        if !(min_nm > 0.0 && min_nm < max_nm) {
            return Err(MonetError::Configuration(format!(
                "Invalid simulated wavelength range [{min_nm}, {max_nm}] nm"
            )));
        }
        if !(rig.noise_std.is_finite() && rig.noise_std >= 0.0) {
            return Err(MonetError::Configuration(format!(
                "Noise standard deviation must be >= 0, got {}",
                rig.noise_std
            )));
        }

        Ok(())
    }
}
