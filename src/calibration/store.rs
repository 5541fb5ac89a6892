//! Calibration store: one curve per wavelength, persisted as JSON.
//!
//! The store is the single place where a calibration for a wavelength gets
//! replaced. Curves are shared as `Arc<CalibrationCurve>`, so replacing an
//! entry is a pointer swap: whoever already holds the previous curve keeps a
//! complete, consistent copy of it.
//!
//! ## File format
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "curves": [
//!     {
//!       "wavelength_nm": 561.0,
//!       "created_at": "2024-05-02T09:41:00Z",
//!       "non_monotonic": false,
//!       "samples": [{ "position": 0.0, "power": 0.0, "recorded_at": "..." }]
//!     }
//!   ]
//! }
//! ```

use super::curve::CalibrationCurve;
use crate::error::{AppResult, MonetError};
use crate::types::Wavelength;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const FORMAT_VERSION: u32 = 1;

/// Mapping from wavelength to its most recent calibration curve.
#[derive(Debug, Clone, Default)]
pub struct CalibrationStore {
    curves: HashMap<Wavelength, Arc<CalibrationCurve>>,
}

#[derive(Serialize, Deserialize)]
struct StoreDocument {
    format_version: u32,
    curves: Vec<CalibrationCurve>,
}

impl CalibrationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the curve for `wavelength`, returning the previous one.
    pub fn put(
        &mut self,
        wavelength: Wavelength,
        curve: CalibrationCurve,
    ) -> AppResult<Option<Arc<CalibrationCurve>>> {
        if curve.wavelength() != wavelength {
            return Err(MonetError::Configuration(format!(
                "Curve measured at {} nm cannot be stored under {} nm",
                curve.wavelength(),
                wavelength
            )));
        }
        let previous = self.curves.insert(wavelength, Arc::new(curve));
        tracing::info!(
            wavelength_nm = wavelength.nanometers(),
            replaced = previous.is_some(),
            "Calibration stored"
        );
        Ok(previous)
    }

    /// Curve for `wavelength`, or `NotCalibrated`.
    pub fn get(&self, wavelength: Wavelength) -> AppResult<Arc<CalibrationCurve>> {
        self.curves
            .get(&wavelength)
            .cloned()
            .ok_or(MonetError::NotCalibrated {
                wavelength: wavelength.nanometers(),
            })
    }

    /// Whether a curve exists for `wavelength`
    pub fn has(&self, wavelength: Wavelength) -> bool {
        self.curves.contains_key(&wavelength)
    }

    /// Calibrated wavelengths in ascending order
    pub fn wavelengths(&self) -> Vec<Wavelength> {
        let mut keys: Vec<_> = self.curves.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Number of stored curves
    pub fn len(&self) -> usize {
        self.curves.len()
    }

    /// Whether the store holds no curves
    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    /// Write the store to `path`.
    ///
    /// The document goes to a sibling temporary file first and is then renamed
    /// over `path`, so readers never observe a partially written store.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let document = StoreDocument {
            format_version: FORMAT_VERSION,
            curves: self
                .wavelengths()
                .into_iter()
                .filter_map(|w| self.curves.get(&w))
                .map(|curve| curve.as_ref().clone())
                .collect(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, path)?;

        tracing::debug!(path = %path.display(), curves = self.len(), "Calibration store saved");
        Ok(())
    }

    /// Read a store from `path`. A missing file yields an empty store.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No calibration store yet, starting empty");
            return Ok(Self::new());
        }

        let json = fs::read_to_string(path)?;
        let document: StoreDocument = serde_json::from_str(&json)?;
        if document.format_version != FORMAT_VERSION {
            return Err(MonetError::Configuration(format!(
                "Unsupported calibration store format {} in {}",
                document.format_version,
                path.display()
            )));
        }

        let mut store = Self::new();
        for curve in document.curves {
            let wavelength = curve.wavelength();
            if store.curves.insert(wavelength, Arc::new(curve)).is_some() {
                return Err(MonetError::Configuration(format!(
                    "Duplicate calibration for {wavelength} nm in {}",
                    path.display()
                )));
            }
        }

        tracing::info!(path = %path.display(), curves = store.len(), "Calibration store loaded");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::curve::CalibrationSample;
    use tempfile::tempdir;

    fn curve(nm: f64, scale: f64) -> CalibrationCurve {
        let samples = (0..5)
            .map(|i| CalibrationSample::now(i as f64 * 10.0, i as f64 * scale))
            .collect();
        CalibrationCurve::from_samples(Wavelength::new(nm).unwrap(), samples, 0.02).unwrap()
    }

    #[test]
    fn put_get_has() {
        let mut store = CalibrationStore::new();
        let green = Wavelength::new(561.0).unwrap();
        assert!(!store.has(green));
        assert!(matches!(
            store.get(green),
            Err(MonetError::NotCalibrated { wavelength }) if wavelength == 561.0
        ));

        let stored = curve(561.0, 1e-3);
        assert!(store.put(green, stored.clone()).unwrap().is_none());
        assert!(store.has(green));
        assert_eq!(*store.get(green).unwrap(), stored);
    }

    #[test]
    fn put_rejects_mismatched_key() {
        let mut store = CalibrationStore::new();
        let red = Wavelength::new(640.0).unwrap();
        assert!(store.put(red, curve(561.0, 1e-3)).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn replacement_keeps_old_readers_intact() {
        let mut store = CalibrationStore::new();
        let green = Wavelength::new(561.0).unwrap();
        store.put(green, curve(561.0, 1e-3)).unwrap();

        let held = store.get(green).unwrap();
        let previous = store.put(green, curve(561.0, 2e-3)).unwrap();

        assert!(Arc::ptr_eq(&held, &previous.unwrap()));
        assert!((held.power_range().1 - 4e-3).abs() < 1e-15);
        assert!((store.get(green).unwrap().power_range().1 - 8e-3).abs() < 1e-15);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calibrations.json");

        let mut store = CalibrationStore::new();
        for nm in [640.0, 488.0, 561.0] {
            store.put(Wavelength::new(nm).unwrap(), curve(nm, nm * 1e-6)).unwrap();
        }
        store.save(&path).unwrap();

        let loaded = CalibrationStore::load(&path).unwrap();
        assert_eq!(loaded.wavelengths(), store.wavelengths());
        for w in store.wavelengths() {
            assert_eq!(*loaded.get(w).unwrap(), *store.get(w).unwrap());
        }
        assert!(!dir.path().join("calibrations.json.tmp").exists());
    }

    #[test]
    fn save_and_load_is_bit_exact() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        // Positions like 0.1 + 7.3 * i and arbitrary averaged powers have no
        // short decimal form
        let mut rng = StdRng::seed_from_u64(42);
        let mut store = CalibrationStore::new();
        for k in 0..50 {
            let wavelength = Wavelength::new(400.0 + k as f64 * 3.7).unwrap();
            let samples = (0..10)
                .map(|i| CalibrationSample::now(0.1 + 7.3 * i as f64, rng.gen_range(0.0..10e-3)))
                .collect();
            let curve = CalibrationCurve::from_samples(wavelength, samples, 0.02).unwrap();
            store.put(wavelength, curve).unwrap();
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("calibrations.json");
        store.save(&path).unwrap();
        let loaded = CalibrationStore::load(&path).unwrap();

        assert_eq!(loaded.len(), store.len());
        for w in store.wavelengths() {
            let (stored, reloaded) = (store.get(w).unwrap(), loaded.get(w).unwrap());
            for (a, b) in stored.samples().iter().zip(reloaded.samples()) {
                assert_eq!(a.position.to_bits(), b.position.to_bits());
                assert_eq!(a.power.to_bits(), b.power.to_bits());
            }
            assert_eq!(*reloaded, *stored);
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = CalibrationStore::load(&dir.path().join("absent.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn load_rejects_duplicates_and_unknown_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let one = serde_json::to_value(curve(561.0, 1e-3)).unwrap();
        let duplicated = serde_json::json!({ "format_version": 1, "curves": [one.clone(), one] });
        fs::write(&path, duplicated.to_string()).unwrap();
        assert!(matches!(
            CalibrationStore::load(&path),
            Err(MonetError::Configuration(_))
        ));

        let future = serde_json::json!({ "format_version": 99, "curves": [] });
        fs::write(&path, future.to_string()).unwrap();
        assert!(CalibrationStore::load(&path).is_err());
    }
}
