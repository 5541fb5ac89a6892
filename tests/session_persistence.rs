//! Integration tests for the session lifecycle and the calibration store file

use monet::calibration::{CalibrationStore, FitModel};
use monet::error::MonetError;
use monet::hardware::{MockRotationMount, ResponseModel, SimulatedPowerMeter};
use monet::procedures::{ControlParams, DeviceTimeouts, SweepConfig, SweepResolution};
use monet::session::{ControlOverrides, SessionContext, SessionSettings, SessionState};
use monet::types::{PositionBounds, Wavelength};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn nm(value: f64) -> Wavelength {
    Wavelength::new(value).unwrap()
}

fn settings(store_path: Option<PathBuf>) -> SessionSettings {
    SessionSettings {
        sweep: SweepConfig {
            min_position: 0.0,
            max_position: 90.0,
            resolution: SweepResolution::Steps(10),
            settle_time: Duration::ZERO,
            averages: 1,
            monotonic_tolerance: 0.02,
            max_points: 10_000,
        },
        control: ControlParams {
            settle_time: Duration::ZERO,
            averages: 1,
            ..Default::default()
        },
        timeouts: DeviceTimeouts::default(),
        reattach_stored_curve: true,
        fit_model: FitModel::None,
        store_path,
    }
}

fn session_with(
    meter: impl FnOnce(&MockRotationMount) -> SimulatedPowerMeter,
    store: CalibrationStore,
    settings: SessionSettings,
) -> (SessionContext, Arc<MockRotationMount>) {
    let mount = Arc::new(MockRotationMount::new(
        PositionBounds::new(0.0, 90.0).unwrap(),
    ));
    let meter = meter(mount.as_ref());
    let ctx = SessionContext::new(mount.clone(), Arc::new(meter), store, settings);
    (ctx, mount)
}

fn linear_meter(mount: &MockRotationMount) -> SimulatedPowerMeter {
    SimulatedPowerMeter::new(
        mount.position_handle(),
        ResponseModel::Linear {
            offset: 0.0,
            slope: 1e-4,
        },
    )
}

#[tokio::test]
async fn test_calibration_is_persisted_and_reloaded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store").join("calibrations.json");

    let (mut ctx, _) = session_with(linear_meter, CalibrationStore::new(), settings(Some(path.clone())));
    ctx.config(nm(561.0)).await.unwrap();
    let curve = ctx.calibrate(None).await.unwrap();
    assert!(path.exists());

    // A fresh session started from the file picks the curve up again
    let store = CalibrationStore::load(&path).unwrap();
    assert_eq!(*store.get(nm(561.0)).unwrap(), *curve);

    let (mut restarted, mount) = session_with(linear_meter, store, settings(Some(path)));
    assert_eq!(
        restarted.config(nm(561.0)).await.unwrap(),
        SessionState::Calibrated
    );
    let result = restarted
        .set(3e-3, ControlOverrides::default())
        .await
        .unwrap();
    assert!((result.position - 30.0).abs() < 0.01);
    assert_eq!(mount.move_count().await, result.iterations);
}

#[tokio::test]
async fn test_non_monotonic_flag_survives_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calibrations.json");

    let polarizer = |mount: &MockRotationMount| {
        SimulatedPowerMeter::new(
            mount.position_handle(),
            ResponseModel::Sinusoid {
                background: 0.0,
                amplitude: 0.05,
                phase_deg: 30.0,
            },
        )
    };
    let (mut ctx, _) = session_with(polarizer, CalibrationStore::new(), settings(Some(path.clone())));
    ctx.config(nm(532.0)).await.unwrap();
    let curve = ctx.calibrate(None).await.unwrap();
    assert!(curve.is_non_monotonic());

    let loaded = CalibrationStore::load(&path).unwrap();
    let reloaded = loaded.get(nm(532.0)).unwrap();
    assert!(reloaded.is_non_monotonic());
    assert_eq!(*reloaded, *curve);
}

#[tokio::test]
async fn test_failed_calibration_keeps_previous_curve() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calibrations.json");

    // Ten good reads for the first sweep, then the detector dies mid-way
    // through the second
    let flaky = |mount: &MockRotationMount| linear_meter(mount).with_fault_after(15);
    let (mut ctx, _) = session_with(flaky, CalibrationStore::new(), settings(Some(path.clone())));
    ctx.config(nm(561.0)).await.unwrap();
    let original = ctx.calibrate(None).await.unwrap();
    let file_before = std::fs::read_to_string(&path).unwrap();

    let err = ctx.calibrate(None).await.unwrap_err();
    assert!(matches!(err, MonetError::SensorFault(_)));

    assert_eq!(ctx.state(), SessionState::Calibrated);
    assert!(Arc::ptr_eq(&ctx.active_curve().unwrap(), &original));
    assert!(Arc::ptr_eq(&ctx.store().get(nm(561.0)).unwrap(), &original));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), file_before);
}

#[tokio::test]
async fn test_recalibration_replaces_curve() {
    let (mut ctx, _) = session_with(linear_meter, CalibrationStore::new(), settings(None));
    ctx.config(nm(561.0)).await.unwrap();
    let first = ctx.calibrate(None).await.unwrap();

    let finer = SweepConfig {
        resolution: SweepResolution::Steps(19),
        ..ctx.settings().sweep.clone()
    };
    let second = ctx.calibrate(Some(finer)).await.unwrap();

    assert_eq!(first.len(), 10);
    assert_eq!(second.len(), 19);
    assert!(Arc::ptr_eq(&ctx.active_curve().unwrap(), &second));
    assert_eq!(ctx.store().len(), 1);
}

#[tokio::test]
async fn test_reload_picks_up_external_changes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calibrations.json");

    let (mut writer, _) = session_with(linear_meter, CalibrationStore::new(), settings(Some(path.clone())));
    let (mut reader, _) = session_with(linear_meter, CalibrationStore::new(), settings(Some(path)));

    reader.config(nm(561.0)).await.unwrap();
    assert_eq!(reader.state(), SessionState::Configured);

    writer.config(nm(561.0)).await.unwrap();
    writer.calibrate(None).await.unwrap();

    assert_eq!(reader.reload().await.unwrap(), 1);
    assert_eq!(reader.state(), SessionState::Calibrated);
}

#[tokio::test]
async fn test_unsupported_wavelength_changes_nothing() {
    let narrow = |mount: &MockRotationMount| linear_meter(mount).with_wavelength_range(450.0, 650.0);
    let (mut ctx, mount) = session_with(narrow, CalibrationStore::new(), settings(None));

    assert!(matches!(
        ctx.config(nm(785.0)).await,
        Err(MonetError::UnsupportedWavelength(_))
    ));
    assert_eq!(ctx.state(), SessionState::Unconfigured);
    assert_eq!(ctx.wavelength(), None);
    assert_eq!(mount.move_count().await, 0);
}

#[tokio::test]
async fn test_convergence_failure_keeps_session_calibrated() {
    let (mut ctx, _) = session_with(linear_meter, CalibrationStore::new(), settings(None));
    ctx.config(nm(561.0)).await.unwrap();
    ctx.calibrate(None).await.unwrap();

    // The curve says 40 deg; a single iteration cannot correct a 20% drift
    let drifted = |mount: &MockRotationMount| {
        SimulatedPowerMeter::new(
            mount.position_handle(),
            ResponseModel::Linear {
                offset: 0.0,
                slope: 0.8e-4,
            },
        )
    };
    let store = ctx.store().clone();
    let (mut drifting, _) = session_with(drifted, store, settings(None));
    drifting.config(nm(561.0)).await.unwrap();

    let overrides = ControlOverrides {
        max_iterations: Some(1),
        ..Default::default()
    };
    let err = drifting.set(4e-3, overrides).await.unwrap_err();
    match err {
        MonetError::ConvergenceFailed {
            best_power,
            best_position,
            iterations,
            ..
        } => {
            assert_eq!(iterations, 1);
            assert!((best_position - 40.0).abs() < 1e-6);
            assert!((best_power - 3.2e-3).abs() < 1e-9);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(drifting.state(), SessionState::Calibrated);
}
