//! End-to-end pipeline tests: joystick mapping, idle watchdog, operator
//! command outcomes, detector intake and shutdown idempotence.

mod common;

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use common::{attach_turret_sims, init_logging, mock_backend, test_config};
use hardware::{Level, MockGpio};
use turret::config::TurretConfig;
use turret::remote::ChannelFeed;
use turret::state::ModeRequest;
use turret::tracker::AxisId;
use turret::{Command, Detection, Direction, TrackerMode, Turret};

fn rig(mutate: impl FnOnce(&mut TurretConfig)) -> (Arc<MockGpio>, TurretConfig, Turret) {
    init_logging();
    let (gpio, backend) = mock_backend();
    let mut config = test_config();
    mutate(&mut config);
    let _sims = attach_turret_sims(&gpio, &config);
    let turret = Turret::new(backend, config.clone()).unwrap();
    (gpio, config, turret)
}

fn camera_ready(turret: &Turret) {
    let commands = turret.commands();
    assert!(commands.execute(Command::SetMode(ModeRequest::Camera)).is_ok());
    assert!(commands.execute(Command::Enable).is_ok());
}

fn poll_position(turret: &Turret, axis: AxisId, expected: i64, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let position = match axis {
            AxisId::X => turret.tracker().x_axis().position(),
            AxisId::Y => turret.tracker().y_axis().position(),
        };
        if position == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{axis:?} stuck at {position}, wanted {expected}"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn joystick_deadzone_and_scaling_map_to_steps() {
    let (_gpio, _config, turret) = rig(|_| {});
    camera_ready(&turret);

    let (tx, rx) = mpsc::channel();
    turret
        .attach_joystick(Box::new(ChannelFeed::new(rx)))
        .unwrap();

    // deadzone 5, scaling 0.10, max 50:
    //   x=50  -> round((50-5)*0.10*50/95) = 2 CW
    //   y=-30 -> round((30-5)*0.10*50/95) = 1 CCW
    tx.send("50,-30,false,false,0".to_string()).unwrap();
    poll_position(&turret, AxisId::X, 2, Duration::from_secs(2));
    poll_position(&turret, AxisId::Y, -1, Duration::from_secs(2));
}

#[test]
fn malformed_joystick_frames_are_dropped_not_fatal() {
    let (_gpio, _config, turret) = rig(|_| {});
    camera_ready(&turret);

    let (tx, rx) = mpsc::channel();
    turret
        .attach_joystick(Box::new(ChannelFeed::new(rx)))
        .unwrap();

    tx.send("definitely,not,a,joystick".to_string()).unwrap();
    tx.send("150,0,true,false,0".to_string()).unwrap();
    // A valid frame afterwards still moves the turret.
    tx.send("100,0,false,false,0".to_string()).unwrap();
    poll_position(&turret, AxisId::X, 5, Duration::from_secs(2));
}

#[test]
fn stick_inside_deadzone_produces_no_commands() {
    let (gpio, config, turret) = rig(|_| {});
    camera_ready(&turret);
    let pulses = common::attach_pulse_counter(&gpio, config.motor.x.step);

    let (tx, rx) = mpsc::channel();
    turret
        .attach_joystick(Box::new(ChannelFeed::new(rx)))
        .unwrap();
    tx.send("4,-3,false,false,0".to_string()).unwrap();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(*pulses.lock().unwrap(), 0);
}

#[test]
fn laser_button_edge_fires_once_at_sample_power() {
    let (_gpio, _config, turret) = rig(|_| {});
    camera_ready(&turret);
    turret.commands().execute(Command::LaserArm(true));

    let (tx, rx) = mpsc::channel();
    turret
        .attach_joystick(Box::new(ChannelFeed::new(rx)))
        .unwrap();

    // Held button: only the rising edge fires.
    tx.send("0,0,false,true,60".to_string()).unwrap();
    tx.send("0,0,false,true,60".to_string()).unwrap();
    tx.send("0,0,false,false,60".to_string()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while turret.laser().status().fire_count == 0 {
        assert!(Instant::now() < deadline, "laser never fired");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(turret.laser().wait_idle(Duration::from_secs(2)));
    let status = turret.laser().status();
    assert_eq!(status.fire_count, 1);
    assert_eq!(status.power_pct, 60);
}

#[test]
fn idle_watchdog_releases_and_next_command_reenables() {
    let (gpio, config, turret) = rig(|config| {
        config.control.idle_timeout = Duration::from_millis(300);
    });
    camera_ready(&turret);
    turret.commands().execute(Command::LaserArm(true));
    assert_eq!(gpio.level(config.motor.x.enable), Some(Level::Low));

    // Silence past the idle timeout: motors released, laser disarmed.
    thread::sleep(Duration::from_millis(700));
    assert_eq!(gpio.level(config.motor.x.enable), Some(Level::High));
    assert_eq!(gpio.level(config.motor.y.enable), Some(Level::High));
    assert!(!turret.laser().is_armed());
    assert_eq!(turret.tracker().mode(), TrackerMode::CameraDisabled);

    // The next command reasserts enable before motion happens.
    let outcome = turret.commands().execute(Command::Jog {
        axis: AxisId::X,
        steps: 3,
        direction: Direction::Cw,
    });
    assert!(outcome.is_ok(), "jog rejected: {outcome:?}");
    poll_position(&turret, AxisId::X, 3, Duration::from_secs(2));
    assert_eq!(gpio.level(config.motor.x.enable), Some(Level::Low));
}

#[test]
fn operator_traffic_does_not_feed_the_watchdog() {
    let (gpio, config, turret) = rig(|config| {
        config.control.idle_timeout = Duration::from_millis(600);
    });
    camera_ready(&turret);
    turret.commands().execute(Command::LaserArm(true));

    // An operator command halfway through the window must not push the
    // release out: only joystick/detector input counts as activity.
    thread::sleep(Duration::from_millis(300));
    assert!(turret.commands().execute(Command::SetHome).is_ok());
    assert_eq!(gpio.level(config.motor.x.enable), Some(Level::Low));

    thread::sleep(Duration::from_millis(500));
    assert_eq!(gpio.level(config.motor.x.enable), Some(Level::High));
    assert_eq!(gpio.level(config.motor.y.enable), Some(Level::High));
    assert!(!turret.laser().is_armed());
    assert_eq!(turret.tracker().mode(), TrackerMode::CameraDisabled);
}

#[test]
fn operator_commands_report_rejections() {
    let (_gpio, _config, turret) = rig(|_| {});

    // Crosshair mode refuses motion, and the refusal reaches telemetry
    // with a sequence number.
    let outcome = turret.commands().execute(Command::CenterOnPixel {
        x: 1200.0,
        y: 400.0,
        frame_w: 1920,
        frame_h: 1080,
    });
    match outcome {
        turret::CommandOutcome::Rejected(reason) => {
            assert!(reason.contains("crosshair"), "unexpected reason: {reason}")
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let snapshot = turret.snapshot();
    assert_eq!(snapshot.mode, TrackerMode::Crosshair);
    let error = snapshot.last_error.expect("rejection recorded");
    assert!(error.seq >= 1);
}

#[test]
fn detector_boxes_steer_the_turret() {
    let (_gpio, _config, turret) = rig(|_| {});
    camera_ready(&turret);

    let bridge = turret.detector_bridge(1920, 1080);
    // The larger box wins: centered at (1060, 540) -> +10 steps on X.
    bridge.on_detection(&[
        Detection {
            kind: "face".into(),
            x: 100.0,
            y: 100.0,
            w: 20.0,
            h: 20.0,
            confidence: 0.9,
        },
        Detection {
            kind: "person".into(),
            x: 1010.0,
            y: 490.0,
            w: 100.0,
            h: 100.0,
            confidence: 0.8,
        },
    ]);

    poll_position(&turret, AxisId::X, 10, Duration::from_secs(2));
    let recent = bridge.recent_target().expect("target recorded");
    assert_eq!((recent.cx, recent.cy), (1060.0, 540.0));

    let snapshot = turret.snapshot();
    assert_eq!(snapshot.last_detection.unwrap().kind, "person");
}

#[test]
fn auto_fire_triggers_on_tracked_targets() {
    let (_gpio, _config, turret) = rig(|_| {});
    camera_ready(&turret);
    turret.commands().execute(Command::LaserArm(true));
    turret.commands().execute(Command::LaserSetPower(35));
    turret.set_auto_fire(true);

    let bridge = turret.detector_bridge(1920, 1080);
    bridge.on_detection(&[Detection {
        kind: "balloon".into(),
        x: 1010.0,
        y: 490.0,
        w: 100.0,
        h: 100.0,
        confidence: 0.95,
    }]);

    let deadline = Instant::now() + Duration::from_secs(2);
    while turret.laser().status().fire_count == 0 {
        assert!(Instant::now() < deadline, "auto-fire never triggered");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn telemetry_publishes_at_its_cadence() {
    let (_gpio, _config, turret) = rig(|_| {});
    let count = Arc::new(std::sync::Mutex::new(0u32));
    let count_clone = Arc::clone(&count);
    turret.telemetry().subscribe(move |_| {
        *count_clone.lock().unwrap() += 1;
    });

    thread::sleep(Duration::from_millis(1200));
    let seen = *count.lock().unwrap();
    assert!((1..=4).contains(&seen), "saw {seen} snapshots in 1.2 s");
}

#[test]
fn shutdown_is_idempotent_and_releases_everything() {
    let (gpio, config, turret) = rig(|_| {});
    camera_ready(&turret);

    turret.shutdown().unwrap();
    turret.shutdown().unwrap();

    // Claims are released (high-impedance), PWM stopped at zero duty.
    assert_eq!(gpio.level(config.motor.x.enable), None);
    assert_eq!(gpio.level(config.motor.y.enable), None);
    assert_eq!(gpio.level(config.motor.x.step), None);
    let pwm = gpio.pwm_state(config.laser.pin).unwrap();
    assert!(!pwm.running);
    assert_eq!(*pwm.history.last().unwrap(), 0.0);

    // The pipeline is closed for business.
    let outcome = turret.commands().execute(Command::Home);
    assert!(matches!(outcome, turret::CommandOutcome::Rejected(_)));
}
