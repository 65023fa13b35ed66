//! Stepper axis behavior against the mock backend: position accounting,
//! limit interlocks and homing.

mod common;

use std::time::Duration;

use common::{attach_axis_sim, init_logging, mock_backend, TravelBounds};
use hardware::Level;
use turret::axis::{AxisConfig, AxisFault, AxisStatus, Direction, StepTermination, StepperAxis};
use turret::cancel::CancelToken;
use turret::TurretError;

fn axis_config() -> AxisConfig {
    AxisConfig {
        name: "test-x",
        step_pin: 23,
        dir_pin: 19,
        enable_pin: 5,
        cw_limit_pin: 18,
        ccw_limit_pin: 21,
        microstep_pins: Some([17, 27, 22]),
        steps_per_rev: 200,
        microsteps: 8,
        step_delay_s: 0.0001,
        acceleration_steps: 2,
        backoff_steps: 1,
        home_timeout: Duration::from_secs(5),
    }
}

#[test]
fn position_follows_emitted_pulses() {
    init_logging();
    let (gpio, backend) = mock_backend();
    let sim = attach_axis_sim(&gpio, 23, 19, 18, 21, 0, None);
    let axis = StepperAxis::new(backend, axis_config()).unwrap();
    let cancel = CancelToken::new();

    let out = axis.step(Direction::Cw, 40, 0.0001, &cancel).unwrap();
    assert_eq!(out.steps_emitted, 40);
    assert_eq!(out.terminated_by, StepTermination::Completed);

    let out = axis.step(Direction::Ccw, 15, 0.0001, &cancel).unwrap();
    assert_eq!(out.steps_emitted, 15);

    assert_eq!(axis.position(), 25);
    assert_eq!(sim.position(), 25);
    assert_eq!(axis.status(), AxisStatus::Idle);
    assert_eq!(axis.last_direction(), Some(Direction::Ccw));
}

#[test]
fn zero_count_is_a_no_op() {
    init_logging();
    let (gpio, backend) = mock_backend();
    let sim = attach_axis_sim(&gpio, 23, 19, 18, 21, 0, None);
    let axis = StepperAxis::new(backend, axis_config()).unwrap();

    let out = axis
        .step(Direction::Cw, 0, 0.0001, &CancelToken::new())
        .unwrap();
    assert_eq!(out.steps_emitted, 0);
    assert_eq!(out.terminated_by, StepTermination::Completed);
    assert_eq!(sim.pulses(), 0);
}

#[test]
fn latched_limit_blocks_same_direction_until_reversed() {
    init_logging();
    let (gpio, backend) = mock_backend();
    let sim = attach_axis_sim(&gpio, 23, 19, 18, 21, 0, None);
    let axis = StepperAxis::new(backend, axis_config()).unwrap();
    let cancel = CancelToken::new();

    // Simulated CW end stop hit.
    assert!(gpio.trigger_edge(18, Level::Low).unwrap());
    assert_eq!(axis.triggered_limit(), Some(Direction::Cw));
    assert_eq!(axis.status(), AxisStatus::LimitReached(Direction::Cw));

    // Every CW request is refused without pulsing the step line.
    for _ in 0..2 {
        let out = axis.step(Direction::Cw, 50, 0.0001, &cancel).unwrap();
        assert_eq!(out.steps_emitted, 0);
        assert_eq!(out.terminated_by, StepTermination::LimitHit);
    }
    assert_eq!(axis.position(), 0);
    assert_eq!(sim.pulses(), 0);

    // Reversing clears the latch and moves.
    let out = axis.step(Direction::Ccw, 5, 0.0001, &cancel).unwrap();
    assert_eq!(out.steps_emitted, 5);
    assert_eq!(axis.triggered_limit(), None);
    assert_eq!(axis.position(), -5);
}

#[test]
fn limit_hit_mid_move_stops_emission() {
    init_logging();
    let (gpio, backend) = mock_backend();
    let sim = attach_axis_sim(
        &gpio,
        23,
        19,
        18,
        21,
        0,
        Some(TravelBounds { min: -100, max: 30 }),
    );
    let axis = StepperAxis::new(backend, axis_config()).unwrap();

    let out = axis
        .step(Direction::Cw, 200, 0.0001, &CancelToken::new())
        .unwrap();
    assert_eq!(out.terminated_by, StepTermination::LimitHit);
    // The pulse that reached the stop was emitted, nothing after it.
    assert_eq!(out.steps_emitted, 30);
    assert_eq!(sim.position(), 30);
    assert_eq!(axis.status(), AxisStatus::LimitReached(Direction::Cw));
}

#[test]
fn homing_centers_between_the_stops() {
    init_logging();
    let (gpio, backend) = mock_backend();
    let sim = attach_axis_sim(
        &gpio,
        23,
        19,
        18,
        21,
        150,
        Some(TravelBounds { min: 0, max: 400 }),
    );
    let axis = StepperAxis::new(backend, axis_config()).unwrap();

    let travel = axis.home(&CancelToken::new()).unwrap();
    // Backoff of one step eats one count of the full 400-step travel.
    assert!((399..=400).contains(&travel), "travel was {travel}");
    assert_eq!(axis.position(), 0);
    assert_eq!(axis.status(), AxisStatus::Idle);

    let center = sim.position();
    assert!(
        (center - 200).abs() <= 1,
        "homed to {center}, expected 200 +/- 1"
    );
}

#[test]
fn homing_times_out_without_switches() {
    init_logging();
    let (gpio, backend) = mock_backend();
    // No travel simulation: the CCW switch never fires.
    let _sim = attach_axis_sim(&gpio, 23, 19, 18, 21, 0, None);
    let mut cfg = axis_config();
    cfg.home_timeout = Duration::from_millis(200);
    let axis = StepperAxis::new(backend, cfg).unwrap();
    axis.enable().unwrap();

    let err = axis.home(&CancelToken::new()).unwrap_err();
    assert!(matches!(err, TurretError::Timeout(_)));
    assert_eq!(axis.status(), AxisStatus::Error(AxisFault::Timeout));
    // Axis left safe: enable released.
    assert!(!axis.is_enabled());
    assert_eq!(gpio.level(5), Some(Level::High));
}

#[test]
fn cancellation_stops_before_the_next_pulse() {
    init_logging();
    let (gpio, backend) = mock_backend();
    let sim = attach_axis_sim(&gpio, 23, 19, 18, 21, 0, None);
    let axis = StepperAxis::new(backend, axis_config()).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let out = axis.step(Direction::Cw, 50, 0.0001, &cancel).unwrap();
    assert_eq!(out.steps_emitted, 0);
    assert_eq!(out.terminated_by, StepTermination::Cancelled);
    assert_eq!(sim.pulses(), 0);
}

#[test]
fn microstep_select_lines_follow_the_table() {
    init_logging();
    let (gpio, backend) = mock_backend();
    let mut cfg = axis_config();
    cfg.microsteps = 8;
    let _axis = StepperAxis::new(backend, cfg).unwrap();

    // 1/8 step on A4988-style drivers: MS1 high, MS2 high, MS3 low.
    assert_eq!(gpio.level(17), Some(Level::High));
    assert_eq!(gpio.level(27), Some(Level::High));
    assert_eq!(gpio.level(22), Some(Level::Low));
}

#[test]
fn enable_line_is_active_low() {
    init_logging();
    let (gpio, backend) = mock_backend();
    let axis = StepperAxis::new(backend, axis_config()).unwrap();

    // Released at construction.
    assert_eq!(gpio.level(5), Some(Level::High));
    axis.enable().unwrap();
    assert_eq!(gpio.level(5), Some(Level::Low));
    axis.release().unwrap();
    assert_eq!(gpio.level(5), Some(Level::High));
}
