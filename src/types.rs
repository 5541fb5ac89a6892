//! Physical quantity types shared by the calibration engine, the devices and the shell.
//!
//! Powers are plain `f64` watts throughout the crate; this module only adds the
//! wavelength key type, actuator bounds, and helpers to read/print powers with units.

use crate::error::{AppResult, MonetError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Laser wavelength in nanometers.
///
/// Always finite and strictly positive, which makes it usable as a map key:
/// equality, ordering and hashing all operate on the bit pattern of the value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Wavelength(f64);

impl Wavelength {
    /// Create a wavelength, rejecting non-finite and non-positive values.
    pub fn new(nanometers: f64) -> AppResult<Self> {
        if !nanometers.is_finite() || nanometers <= 0.0 {
            return Err(MonetError::Configuration(format!(
                "Wavelength must be a positive number of nanometers, got {nanometers}"
            )));
        }
        Ok(Self(nanometers))
    }

    /// Value in nanometers.
    pub fn nanometers(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Wavelength {
    type Error = MonetError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Wavelength> for f64 {
    fn from(value: Wavelength) -> Self {
        value.0
    }
}

impl PartialEq for Wavelength {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Wavelength {}

impl Hash for Wavelength {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for Wavelength {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Wavelength {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Wavelength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Travel limits of an actuator, in its native units (degrees for rotation mounts).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionBounds {
    /// Lowest reachable position
    pub min: f64,
    /// Highest reachable position
    pub max: f64,
}

impl PositionBounds {
    /// Create bounds, rejecting empty or non-finite ranges.
    pub fn new(min: f64, max: f64) -> AppResult<Self> {
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(MonetError::Configuration(format!(
                "Invalid position bounds [{min}, {max}]"
            )));
        }
        Ok(Self { min, max })
    }

    /// Whether `position` lies within the bounds (inclusive).
    pub fn contains(&self, position: f64) -> bool {
        position >= self.min && position <= self.max
    }

    /// Clamp `position` into the bounds.
    pub fn clamp(&self, position: f64) -> f64 {
        position.clamp(self.min, self.max)
    }
}

impl Default for PositionBounds {
    /// A full turn, as exposed by continuous rotation mounts such as the ELL14.
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 360.0,
        }
    }
}

const POWER_UNITS: [(&str, f64); 4] = [("nw", 1e-9), ("uw", 1e-6), ("mw", 1e-3), ("w", 1.0)];

/// Whether `token` is a power unit on its own (`mW`, `uW`, `W`...).
pub fn is_power_unit(token: &str) -> bool {
    let unit = token.trim().to_ascii_lowercase().replace('µ', "u");
    POWER_UNITS.iter().any(|(suffix, _)| unit == *suffix)
}

/// Parse a power such as `4.5mW`, `0.2 W` or `300uW` into watts.
///
/// A bare number is interpreted in `default_scale` watts (the shell uses milliwatts).
pub fn parse_power(input: &str, default_scale: f64) -> AppResult<f64> {
    let text = input.trim().to_ascii_lowercase().replace('µ', "u");
    let (number, scale) = POWER_UNITS
        .iter()
        .find_map(|(suffix, scale)| {
            text.strip_suffix(suffix)
                .map(|rest| (rest.trim().to_string(), *scale))
        })
        .unwrap_or((text.clone(), default_scale));

    let value: f64 = number
        .parse()
        .map_err(|_| MonetError::InvalidCommand(format!("Cannot parse power '{input}'")))?;
    if !value.is_finite() {
        return Err(MonetError::InvalidCommand(format!(
            "Power must be finite, got '{input}'"
        )));
    }
    Ok(value * scale)
}

/// Render a power in watts with the most readable SI prefix.
pub fn format_power(watts: f64) -> String {
    let magnitude = watts.abs();
    if magnitude >= 1.0 {
        format!("{watts:.4} W")
    } else if magnitude >= 1e-3 {
        format!("{:.4} mW", watts * 1e3)
    } else if magnitude >= 1e-6 {
        format!("{:.4} uW", watts * 1e6)
    } else if magnitude == 0.0 {
        "0 W".to_string()
    } else {
        format!("{:.4} nW", watts * 1e9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn wavelength_rejects_nonsense() {
        assert!(Wavelength::new(0.0).is_err());
        assert!(Wavelength::new(-488.0).is_err());
        assert!(Wavelength::new(f64::NAN).is_err());
        assert!(Wavelength::new(561.0).is_ok());
    }

    #[test]
    fn wavelength_is_a_usable_key() {
        let mut set = HashSet::new();
        set.insert(Wavelength::new(488.0).unwrap());
        set.insert(Wavelength::new(488.0).unwrap());
        set.insert(Wavelength::new(640.0).unwrap());
        assert_eq!(set.len(), 2);
        assert!(Wavelength::new(488.0).unwrap() < Wavelength::new(561.0).unwrap());
    }

    #[test]
    fn wavelength_deserialization_validates() {
        let ok: Wavelength = serde_json::from_str("561.0").unwrap();
        assert_eq!(ok.nanometers(), 561.0);
        assert!(serde_json::from_str::<Wavelength>("-1.0").is_err());
    }

    #[test]
    fn parses_power_units() {
        assert!((parse_power("4.5mW", 1e-3).unwrap() - 4.5e-3).abs() < 1e-15);
        assert!((parse_power("0.2 W", 1e-3).unwrap() - 0.2).abs() < 1e-15);
        assert!((parse_power("300uW", 1e-3).unwrap() - 300e-6).abs() < 1e-15);
        assert!((parse_power("12nw", 1e-3).unwrap() - 12e-9).abs() < 1e-18);
        assert!((parse_power("7", 1e-3).unwrap() - 7e-3).abs() < 1e-15);
        assert!(parse_power("lots", 1e-3).is_err());
        assert!(parse_power("inf mW", 1e-3).is_err());
    }

    #[test]
    fn recognizes_bare_units() {
        assert!(is_power_unit("mW"));
        assert!(is_power_unit("µW"));
        assert!(is_power_unit("W"));
        assert!(!is_power_unit("5"));
        assert!(!is_power_unit("5mW"));
        assert!(!is_power_unit("furlongs"));
    }

    #[test]
    fn formats_power_with_prefix() {
        assert_eq!(format_power(4.5e-3), "4.5000 mW");
        assert_eq!(format_power(1.25), "1.2500 W");
        assert_eq!(format_power(3e-7), "300.0000 nW");
        assert_eq!(format_power(0.0), "0 W");
    }

    #[test]
    fn bounds_validation_and_clamp() {
        assert!(PositionBounds::new(10.0, 10.0).is_err());
        let bounds = PositionBounds::new(0.0, 90.0).unwrap();
        assert!(bounds.contains(90.0));
        assert!(!bounds.contains(90.1));
        assert_eq!(bounds.clamp(-5.0), 0.0);
    }
}
