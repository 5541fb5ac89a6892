//! Integration tests for the calibrate -> store -> set workflow
//!
//! These run the sweep and the control loop against the simulated rig and
//! check the end-to-end behaviour the shell relies on.

use monet::calibration::{fit_curve, CalibrationStore, FitModel, ResponseFit};
use monet::error::MonetError;
use monet::hardware::{MockRotationMount, ResponseModel, RotationActuator, SimulatedPowerMeter};
use monet::procedures::{
    build_curve, set_power, AbortSignal, ControlParams, DeviceTimeouts, SweepConfig,
    SweepResolution,
};
use monet::types::{PositionBounds, Wavelength};
use std::sync::Arc;
use std::time::Duration;

fn green() -> Wavelength {
    Wavelength::new(561.0).unwrap()
}

fn quarter_turn() -> PositionBounds {
    PositionBounds::new(0.0, 90.0).unwrap()
}

fn sweep(step: f64) -> SweepConfig {
    SweepConfig {
        min_position: 0.0,
        max_position: 90.0,
        resolution: SweepResolution::StepSize(step),
        settle_time: Duration::ZERO,
        averages: 1,
        monotonic_tolerance: 0.02,
        max_points: 10_000,
    }
}

fn control() -> ControlParams {
    ControlParams {
        tolerance: 0.1e-3,
        settle_time: Duration::ZERO,
        averages: 1,
        ..Default::default()
    }
}

/// Attenuator passing 0 mW at 0 deg up to 9 mW at 90 deg
fn linear_rig() -> (MockRotationMount, SimulatedPowerMeter) {
    let mount = MockRotationMount::new(quarter_turn());
    let meter = SimulatedPowerMeter::new(
        mount.position_handle(),
        ResponseModel::Linear {
            offset: 0.0,
            slope: 1e-4,
        },
    );
    (mount, meter)
}

/// Half-wave plate and polarizer: falls to extinction at 37.5 deg, peaks at 82.5 deg
fn polarizer_rig() -> (MockRotationMount, SimulatedPowerMeter) {
    let mount = MockRotationMount::new(quarter_turn());
    let meter = SimulatedPowerMeter::new(
        mount.position_handle(),
        ResponseModel::Sinusoid {
            background: 0.0,
            amplitude: 0.05,
            phase_deg: 30.0,
        },
    );
    (mount, meter)
}

// =============================================================================
// Linear attenuator at 561 nm
// =============================================================================

#[tokio::test]
async fn test_561nm_calibrate_and_set() {
    let (mount, meter) = linear_rig();
    let abort = AbortSignal::new();
    let timeouts = DeviceTimeouts::default();

    let curve = build_curve(green(), &mount, &meter, &sweep(10.0), &timeouts, &abort)
        .await
        .unwrap();
    assert_eq!(curve.len(), 10);
    assert!(!curve.is_non_monotonic());
    let positions: Vec<f64> = curve.samples().iter().map(|s| s.position).collect();
    assert!(positions.windows(2).all(|w| w[1] > w[0]));

    let mut store = CalibrationStore::new();
    store.put(green(), curve).unwrap();

    let result = set_power(
        &store,
        green(),
        4.5e-3,
        &mount,
        &meter,
        &control(),
        &timeouts,
        &abort,
    )
    .await
    .unwrap();

    assert!((result.position - 45.0).abs() < 0.01);
    assert!((result.measured_power - 4.5e-3).abs() <= 0.1e-3);
    assert!(result.iterations <= 2);
    assert_eq!(mount.current_position().await.unwrap(), result.position);
}

#[tokio::test]
async fn test_561nm_out_of_range_target_does_not_move() {
    let (mount, meter) = linear_rig();
    let abort = AbortSignal::new();
    let timeouts = DeviceTimeouts::default();

    let curve = build_curve(green(), &mount, &meter, &sweep(10.0), &timeouts, &abort)
        .await
        .unwrap();
    let mut store = CalibrationStore::new();
    store.put(green(), curve).unwrap();
    let moves_after_sweep = mount.move_count().await;

    let err = set_power(
        &store,
        green(),
        15e-3,
        &mount,
        &meter,
        &control(),
        &timeouts,
        &abort,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        MonetError::TargetOutOfRange { target, .. } if target == 15e-3
    ));
    assert_eq!(mount.move_count().await, moves_after_sweep);
}

#[tokio::test]
async fn test_other_wavelength_is_not_calibrated() {
    let (mount, meter) = linear_rig();
    let abort = AbortSignal::new();
    let timeouts = DeviceTimeouts::default();

    let curve = build_curve(green(), &mount, &meter, &sweep(10.0), &timeouts, &abort)
        .await
        .unwrap();
    let mut store = CalibrationStore::new();
    store.put(green(), curve).unwrap();

    let err = set_power(
        &store,
        Wavelength::new(640.0).unwrap(),
        1e-3,
        &mount,
        &meter,
        &control(),
        &timeouts,
        &abort,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, MonetError::NotCalibrated { wavelength } if wavelength == 640.0));
}

// =============================================================================
// Non-monotonic (polarizer) response
// =============================================================================

#[tokio::test]
async fn test_polarizer_curve_is_flagged_and_converges_near_actuator() {
    let (mount, meter) = polarizer_rig();
    let abort = AbortSignal::new();
    let timeouts = DeviceTimeouts::default();

    let curve = build_curve(green(), &mount, &meter, &sweep(5.0), &timeouts, &abort)
        .await
        .unwrap();
    assert_eq!(curve.len(), 19);
    assert!(curve.is_non_monotonic());

    // The wave plate model recovers the rig's parameters from the sweep
    let fit = fit_curve(&curve, FitModel::Sinusoid).unwrap().unwrap();
    match fit.model {
        ResponseFit::Sinusoid {
            amplitude,
            phase_deg,
            ..
        } => {
            assert!((amplitude - 0.05).abs() < 1e-9);
            assert!((phase_deg - 30.0).abs() < 1e-6);
        }
        other => panic!("unexpected fit {other:?}"),
    }

    let mut store = CalibrationStore::new();
    store.put(green(), curve).unwrap();

    // The sweep ends at 90 deg: the rising flank (25 mW at 60 deg) is nearest
    let result = set_power(
        &store,
        green(),
        25e-3,
        &mount,
        &meter,
        &control(),
        &timeouts,
        &abort,
    )
    .await
    .unwrap();
    assert!(result.ambiguous_lookup);
    assert!((result.position - 60.0).abs() < 1.0);
    assert!((result.measured_power - 25e-3).abs() <= 0.1e-3);

    // From 10 deg the falling flank (25 mW at 15 deg) is nearest
    mount.move_to(10.0).await.unwrap();
    let result = set_power(
        &store,
        green(),
        25e-3,
        &mount,
        &meter,
        &control(),
        &timeouts,
        &abort,
    )
    .await
    .unwrap();
    assert!((result.position - 15.0).abs() < 1.0);
}

// =============================================================================
// Abort and timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_abort_during_sweep_leaves_actuator_in_place() {
    let (mount, meter) = linear_rig();
    let mount = mount.with_speed(100.0);
    let abort = AbortSignal::new();

    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.trigger("test");
    });

    let err = build_curve(
        green(),
        &mount,
        &meter,
        &sweep(10.0),
        &DeviceTimeouts::default(),
        &abort,
    )
    .await
    .unwrap_err();

    // The clock is paused: 0 deg is reached at t=0, the abort fires at 30 ms
    // while the 100 ms move to 10 deg is in progress
    assert!(matches!(err, MonetError::Aborted { position: Some(p) } if p == 10.0));
    assert_eq!(mount.move_count().await, 2);
    assert_eq!(mount.current_position().await.unwrap(), 10.0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_actuator_times_out() {
    let (mount, meter) = linear_rig();
    let mount = mount.with_speed(10.0);
    let timeouts = DeviceTimeouts {
        move_timeout: Duration::from_millis(100),
        ..Default::default()
    };

    let err = build_curve(
        green(),
        &mount,
        &meter,
        &sweep(10.0),
        &timeouts,
        &AbortSignal::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, MonetError::ActuatorTimeout { target, .. } if target == 10.0));
    assert!(err.is_device_fault());
}

#[tokio::test]
async fn test_noisy_meter_still_converges() {
    let mount = Arc::new(MockRotationMount::new(quarter_turn()));
    let meter = SimulatedPowerMeter::new(
        mount.position_handle(),
        ResponseModel::Linear {
            offset: 0.0,
            slope: 1e-4,
        },
    )
    .with_noise(5e-6);
    let abort = AbortSignal::new();
    let timeouts = DeviceTimeouts::default();

    let config = SweepConfig {
        averages: 4,
        ..sweep(10.0)
    };
    let curve = build_curve(green(), mount.as_ref(), &meter, &config, &timeouts, &abort)
        .await
        .unwrap();
    let mut store = CalibrationStore::new();
    store.put(green(), curve).unwrap();

    let result = set_power(
        &store,
        green(),
        6e-3,
        mount.as_ref(),
        &meter,
        &ControlParams {
            averages: 4,
            ..control()
        },
        &timeouts,
        &abort,
    )
    .await
    .unwrap();
    assert!((result.measured_power - 6e-3).abs() <= 0.1e-3);
    assert!((result.position - 60.0).abs() < 2.0);
}
