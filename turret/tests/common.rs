//! Shared test rig: a mock GPIO with simulated mechanism travel.
//!
//! The simulator observes step/dir writes, integrates a virtual position
//! per axis, and injects limit-switch edges when the mechanism reaches its
//! configured end stops, standing in for the real mechanism.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use hardware::{GpioBackend, Level, MockGpio, Pin};
use turret::config::TurretConfig;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Configuration tuned for fast, deterministic tests.
pub fn test_config() -> TurretConfig {
    let mut config = TurretConfig::default();
    config.control.step_delay_s = 0.0001;
    config.control.acceleration_steps = 2;
    config.control.home_timeout = Duration::from_secs(5);
    config.laser.cooldown = Duration::from_millis(200);
    config.laser.pulse = Duration::from_millis(50);
    config
}

/// Travel simulation state for one axis.
pub struct TravelSim {
    position: Mutex<i64>,
    pulses: Mutex<u64>,
}

impl TravelSim {
    pub fn position(&self) -> i64 {
        *self.position.lock().unwrap()
    }

    pub fn pulses(&self) -> u64 {
        *self.pulses.lock().unwrap()
    }
}

/// Mechanical end stops for a simulated axis.
#[derive(Clone, Copy)]
pub struct TravelBounds {
    pub min: i64,
    pub max: i64,
}

/// Attach a travel simulator for one axis to the mock backend.
///
/// Every rising edge on `step_pin` moves the virtual mechanism one step in
/// the direction the `dir_pin` level selects. With bounds, reaching an end
/// stop injects the matching limit-switch edge; moving off a stop releases
/// the switch again.
pub fn attach_axis_sim(
    gpio: &Arc<MockGpio>,
    step_pin: Pin,
    dir_pin: Pin,
    cw_limit_pin: Pin,
    ccw_limit_pin: Pin,
    start: i64,
    bounds: Option<TravelBounds>,
) -> Arc<TravelSim> {
    let sim = Arc::new(TravelSim {
        position: Mutex::new(start),
        pulses: Mutex::new(0),
    });
    let sim_ref = Arc::clone(&sim);
    let weak: Weak<MockGpio> = Arc::downgrade(gpio);

    gpio.add_write_observer(Box::new(move |pin, level| {
        if pin != step_pin || level != Level::High {
            return;
        }
        let Some(gpio) = weak.upgrade() else {
            return;
        };
        let delta = if gpio.level(dir_pin) == Some(Level::High) {
            1
        } else {
            -1
        };
        let position = {
            let mut position = sim_ref.position.lock().unwrap();
            *position += delta;
            *sim_ref.pulses.lock().unwrap() += 1;
            *position
        };

        if let Some(bounds) = bounds {
            if position <= bounds.min {
                let _ = gpio.trigger_edge(ccw_limit_pin, Level::Low);
            } else if position >= bounds.max {
                let _ = gpio.trigger_edge(cw_limit_pin, Level::Low);
            } else {
                // Off the stops: both switches read released again.
                if gpio.level(cw_limit_pin) == Some(Level::Low) {
                    let _ = gpio.set_input_level(cw_limit_pin, Level::High);
                }
                if gpio.level(ccw_limit_pin) == Some(Level::Low) {
                    let _ = gpio.set_input_level(ccw_limit_pin, Level::High);
                }
            }
        }
    }));
    sim
}

/// Count rising edges on one pin (step pulses, laser gate, ...).
pub fn attach_pulse_counter(gpio: &Arc<MockGpio>, pin: Pin) -> Arc<Mutex<u64>> {
    let counter = Arc::new(Mutex::new(0u64));
    let counter_ref = Arc::clone(&counter);
    gpio.add_write_observer(Box::new(move |written, level| {
        if written == pin && level == Level::High {
            *counter_ref.lock().unwrap() += 1;
        }
    }));
    counter
}

/// Mock backend plus the dyn handle the core consumes.
pub fn mock_backend() -> (Arc<MockGpio>, Arc<dyn GpioBackend>) {
    let gpio = Arc::new(MockGpio::new());
    let backend: Arc<dyn GpioBackend> = gpio.clone();
    (gpio, backend)
}

/// Simulators for both axes of a full turret config, with generous travel
/// so ordinary moves never hit the stops.
pub fn attach_turret_sims(
    gpio: &Arc<MockGpio>,
    config: &TurretConfig,
) -> (Arc<TravelSim>, Arc<TravelSim>) {
    let x = attach_axis_sim(
        gpio,
        config.motor.x.step,
        config.motor.x.dir,
        config.pins.x_cw_limit,
        config.pins.x_ccw_limit,
        400,
        Some(TravelBounds { min: 0, max: 800 }),
    );
    let y = attach_axis_sim(
        gpio,
        config.motor.y.step,
        config.motor.y.dir,
        config.pins.y_cw_limit,
        config.pins.y_ccw_limit,
        400,
        Some(TravelBounds { min: 0, max: 800 }),
    );
    (x, y)
}
