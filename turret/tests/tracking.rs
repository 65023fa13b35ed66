//! Tracking controller behavior: dead zone, pixel-to-step conversion,
//! PID bounds, loss recentering and the mode state machine.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    attach_pulse_counter, attach_turret_sims, init_logging, mock_backend, test_config,
};
use hardware::MockGpio;
use turret::calibration::Calibration;
use turret::config::TurretConfig;
use turret::state::{ModeRequest, TrackerMode};
use turret::tracker::{AxisId, TrackingController};
use turret::TurretError;

const FRAME_W: u32 = 1920;
const FRAME_H: u32 = 1080;

fn rig(
    mutate: impl FnOnce(&mut TurretConfig),
) -> (Arc<MockGpio>, TurretConfig, TrackingController) {
    init_logging();
    let (gpio, backend) = mock_backend();
    let mut config = test_config();
    mutate(&mut config);
    let _sims = attach_turret_sims(&gpio, &config);
    let calibration = Calibration::from_settings(&config.tracking);
    let controller = TrackingController::new(backend, &config, calibration).unwrap();
    (gpio, config, controller)
}

fn camera_ready(controller: &TrackingController) {
    controller.set_mode(ModeRequest::Camera).unwrap();
    controller.enable().unwrap();
}

#[test]
fn dead_zone_suppresses_motion_entirely() {
    let (gpio, config, controller) = rig(|_| {});
    camera_ready(&controller);
    let x_pulses = attach_pulse_counter(&gpio, config.motor.x.step);
    let y_pulses = attach_pulse_counter(&gpio, config.motor.y.step);

    // Ten samples 5 px off center, inside the 20 px dead zone.
    let base = Instant::now();
    for i in 0..10 {
        controller
            .track_target(
                965.0,
                545.0,
                FRAME_W,
                FRAME_H,
                base + Duration::from_millis(10 * i),
            )
            .unwrap();
    }
    let age = controller.last_target_age().expect("target seen");
    assert!(age < Duration::from_millis(5), "age was {age:?}");

    assert!(controller.wait_idle(Duration::from_secs(2)));
    assert_eq!(*x_pulses.lock().unwrap(), 0);
    assert_eq!(*y_pulses.lock().unwrap(), 0);
    assert_eq!(controller.x_axis().position(), 0);
    assert_eq!(controller.y_axis().position(), 0);
}

#[test]
fn pixel_error_converts_to_steps() {
    let (_gpio, _config, controller) = rig(|_| {});
    camera_ready(&controller);

    // 100 px error on X with kp=1 and 0.1 steps/px.
    controller
        .track_target(1060.0, 540.0, FRAME_W, FRAME_H, Instant::now())
        .unwrap();
    assert!(controller.wait_idle(Duration::from_secs(2)));
    assert_eq!(controller.x_axis().position(), 10);
    assert_eq!(controller.y_axis().position(), 0);
}

#[test]
fn integral_stays_inside_its_clamp() {
    let (_gpio, config, controller) = rig(|config| {
        config.tracking.pid.ki = 0.5;
    });
    camera_ready(&controller);
    let limit = config.tracking.x_max_steps_from_home as f64 / config.tracking.pid.kp;

    let base = Instant::now();
    for i in 0..200u64 {
        controller
            .track_target(
                1060.0,
                540.0,
                FRAME_W,
                FRAME_H,
                base + Duration::from_micros(500 * i),
            )
            .unwrap();
        let (ix, _) = controller.pid_integrals();
        assert!(ix.abs() < limit, "integral {ix} exceeded clamp {limit}");
    }
    assert!(controller.wait_idle(Duration::from_secs(5)));
    let (ix, iy) = controller.pid_integrals();
    assert!(ix.abs() < limit);
    assert_eq!(iy, 0.0);
}

#[test]
fn calibration_round_trips_pixels_to_steps() {
    let (_gpio, _config, controller) = rig(|_| {});
    camera_ready(&controller);

    // 200 executed steps moved the target 50 px -> 4 steps per pixel.
    let ratio = controller.calibrate_axis(AxisId::X, 50.0, 200).unwrap();
    assert_eq!(ratio, 4.0);

    let (dx, dy) = controller
        .center_on_pixel(1010.0, 540.0, FRAME_W, FRAME_H)
        .unwrap();
    assert_eq!((dx, dy), (200, 0));

    assert!(controller.wait_idle(Duration::from_secs(2)));
    assert_eq!(controller.x_axis().position(), 200);
}

#[test]
fn calibration_rejects_zero_pixels() {
    let (_gpio, _config, controller) = rig(|_| {});
    assert!(matches!(
        controller.calibrate_axis(AxisId::X, 0.0, 100),
        Err(TurretError::Malformed(_))
    ));
}

#[test]
fn center_inside_dead_zone_moves_nothing() {
    let (gpio, config, controller) = rig(|_| {});
    camera_ready(&controller);
    let x_pulses = attach_pulse_counter(&gpio, config.motor.x.step);

    let (dx, dy) = controller
        .center_on_pixel(975.0, 550.0, FRAME_W, FRAME_H)
        .unwrap();
    assert_eq!((dx, dy), (0, 0));
    assert!(controller.wait_idle(Duration::from_secs(1)));
    assert_eq!(*x_pulses.lock().unwrap(), 0);
}

#[test]
fn moves_clamp_to_travel_bounds() {
    let (_gpio, _config, controller) = rig(|config| {
        config.tracking.x_max_steps_from_home = 300;
    });
    camera_ready(&controller);

    controller.move_by(500, 0).unwrap();
    assert!(controller.wait_idle(Duration::from_secs(2)));
    assert_eq!(controller.x_axis().position(), 300);

    // Absolute moves clamp the same way.
    controller.move_absolute(-900, 0).unwrap();
    assert!(controller.wait_idle(Duration::from_secs(2)));
    assert_eq!(controller.x_axis().position(), -300);
}

#[test]
fn lost_target_recenters_toward_home() {
    let (_gpio, _config, controller) = rig(|config| {
        config.tracking.recenter_on_loss = true;
        config.tracking.x_steps_per_pixel = 2.0;
        config.tracking.home_recenter_rate = 50;
    });
    camera_ready(&controller);

    // One tracked sample drives X out to +200.
    controller
        .track_target(1060.0, 540.0, FRAME_W, FRAME_H, Instant::now())
        .unwrap();
    assert!(controller.wait_idle(Duration::from_secs(2)));
    assert_eq!(controller.x_axis().position(), 200);

    // Silence. After the loss timeout the mover walks the axis home.
    let deadline = Instant::now() + Duration::from_secs(3);
    while controller.x_axis().position() != 0 {
        assert!(Instant::now() < deadline, "never recentered");
        std::thread::sleep(Duration::from_millis(25));
        let (ix, iy) = controller.pid_integrals();
        assert_eq!((ix, iy), (0.0, 0.0), "PID state survived target loss");
    }

    // Settles in idle once home.
    let deadline = Instant::now() + Duration::from_secs(1);
    while controller.mode() != TrackerMode::CameraIdle {
        assert!(Instant::now() < deadline, "mode stuck at {}", controller.mode());
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(controller.y_axis().position(), 0);
}

#[test]
fn crosshair_mode_rejects_all_motion() {
    let (_gpio, _config, controller) = rig(|_| {});
    assert_eq!(controller.mode(), TrackerMode::Crosshair);

    assert!(matches!(
        controller.move_by(10, 0),
        Err(TurretError::ModeDisabled(TrackerMode::Crosshair))
    ));
    assert!(matches!(
        controller.track_target(1060.0, 540.0, FRAME_W, FRAME_H, Instant::now()),
        Err(TurretError::ModeDisabled(_))
    ));
    assert!(matches!(
        controller.center_on_pixel(1060.0, 540.0, FRAME_W, FRAME_H),
        Err(TurretError::ModeDisabled(_))
    ));
    assert!(matches!(
        controller.home(),
        Err(TurretError::ModeDisabled(_))
    ));
}

#[test]
fn mode_machine_walks_the_expected_states() {
    let (_gpio, _config, controller) = rig(|_| {});

    controller.set_mode(ModeRequest::Camera).unwrap();
    assert_eq!(controller.mode(), TrackerMode::CameraIdle);
    controller.enable().unwrap();

    controller.move_by(10, 0).unwrap();
    assert_eq!(controller.mode(), TrackerMode::CameraTracking);
    assert!(controller.wait_idle(Duration::from_secs(2)));

    controller.disable().unwrap();
    assert_eq!(controller.mode(), TrackerMode::CameraDisabled);
    assert!(!controller.x_axis().is_enabled());
    assert!(matches!(
        controller.move_by(5, 0),
        Err(TurretError::ModeDisabled(TrackerMode::CameraDisabled))
    ));

    controller.enable().unwrap();
    assert_eq!(controller.mode(), TrackerMode::CameraIdle);
}

#[test]
fn leaving_camera_mode_homes_first() {
    let (_gpio, _config, controller) = rig(|_| {});
    camera_ready(&controller);

    controller.move_by(120, -40).unwrap();
    assert!(controller.wait_idle(Duration::from_secs(2)));
    assert_eq!(controller.x_axis().position(), 120);

    controller.set_mode(ModeRequest::Crosshair).unwrap();
    assert_eq!(controller.mode(), TrackerMode::Crosshair);
    // Homing re-zeroed both axes on the way out.
    assert_eq!(controller.x_axis().position(), 0);
    assert_eq!(controller.y_axis().position(), 0);
}

#[test]
fn set_home_here_rezeroes_without_motion() {
    let (gpio, config, controller) = rig(|_| {});
    camera_ready(&controller);

    controller.move_by(42, 7).unwrap();
    assert!(controller.wait_idle(Duration::from_secs(2)));

    let pulses = attach_pulse_counter(&gpio, config.motor.x.step);
    controller.set_home_here();
    assert_eq!(controller.x_axis().position(), 0);
    assert_eq!(controller.y_axis().position(), 0);
    assert_eq!(*pulses.lock().unwrap(), 0);
}
