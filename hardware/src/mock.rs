//! In-memory GPIO backend for tests.
//!
//! Keeps a pin map, lets tests inject edge events with
//! [`MockGpio::trigger_edge`], and exposes write observers so a test rig
//! can watch step pulses and simulate mechanism travel. PWM channels
//! record their full duty-cycle history for later inspection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::gpio::{
    check_freq, clamp_duty, EdgeHandler, EdgeKind, GpioBackend, GpioError, GpioResult, Level, Pin,
    PinMode, PwmChannel, Pull,
};

/// Observer invoked after every output write, outside the pin-map lock.
pub type WriteObserver = Box<dyn Fn(Pin, Level) + Send + Sync>;

#[derive(Debug, Clone)]
struct PinEntry {
    mode: PinMode,
    level: Level,
}

struct WatchEntry {
    edge: EdgeKind,
    debounce: Duration,
    handler: EdgeHandler,
    last_accepted: Option<Instant>,
}

/// Recorded state of one mock PWM channel.
#[derive(Debug, Clone)]
pub struct MockPwmState {
    pub freq_hz: f64,
    pub duty_pct: f64,
    pub running: bool,
    /// Every duty value ever applied, in order.
    pub history: Vec<f64>,
}

impl MockPwmState {
    fn new(freq_hz: f64) -> Self {
        Self {
            freq_hz,
            duty_pct: 0.0,
            running: false,
            history: Vec::new(),
        }
    }

    fn apply(&mut self, duty_pct: f64) {
        self.duty_pct = duty_pct;
        self.history.push(duty_pct);
    }
}

struct MockPwm {
    pin: Pin,
    state: Arc<Mutex<MockPwmState>>,
}

impl PwmChannel for MockPwm {
    fn start(&mut self, duty_pct: f64) -> GpioResult<()> {
        let duty = clamp_duty(duty_pct)?;
        let mut state = self.state.lock().expect("mock PWM state poisoned");
        state.running = true;
        state.apply(duty);
        debug!(pin = self.pin, duty, "mock PWM started");
        Ok(())
    }

    fn set_duty(&mut self, duty_pct: f64) -> GpioResult<()> {
        let duty = clamp_duty(duty_pct)?;
        let mut state = self.state.lock().expect("mock PWM state poisoned");
        state.apply(duty);
        Ok(())
    }

    fn set_freq(&mut self, freq_hz: f64) -> GpioResult<()> {
        let freq = check_freq(freq_hz)?;
        self.state.lock().expect("mock PWM state poisoned").freq_hz = freq;
        Ok(())
    }

    fn stop(&mut self) -> GpioResult<()> {
        let mut state = self.state.lock().expect("mock PWM state poisoned");
        state.running = false;
        state.apply(0.0);
        debug!(pin = self.pin, "mock PWM stopped");
        Ok(())
    }

    fn duty(&self) -> f64 {
        let state = self.state.lock().expect("mock PWM state poisoned");
        if state.running {
            state.duty_pct
        } else {
            0.0
        }
    }
}

/// Scriptable in-memory GPIO backend.
#[derive(Default)]
pub struct MockGpio {
    pins: Mutex<HashMap<Pin, PinEntry>>,
    watches: Mutex<HashMap<Pin, WatchEntry>>,
    observers: Mutex<Vec<WriteObserver>>,
    pwms: Mutex<HashMap<Pin, Arc<Mutex<MockPwmState>>>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer called after every output write.
    pub fn add_write_observer(&self, observer: WriteObserver) {
        self.observers
            .lock()
            .expect("observer list poisoned")
            .push(observer);
    }

    /// Force an input pin to a level without running edge dispatch.
    pub fn set_input_level(&self, pin: Pin, level: Level) -> GpioResult<()> {
        let mut pins = self.pins.lock().expect("pin map poisoned");
        let entry = pins.get_mut(&pin).ok_or(GpioError::UnconfiguredPin(pin))?;
        entry.level = level;
        Ok(())
    }

    /// Inject an edge event on a watched pin.
    ///
    /// Applies the same acceptance rules the real backend does: the edge
    /// polarity must match the watch, repeated events inside the debounce
    /// window are suppressed, and a confirmation read must still see the
    /// event level. Returns `true` when the handler was invoked.
    pub fn trigger_edge(&self, pin: Pin, level: Level) -> GpioResult<bool> {
        let previous = {
            let mut pins = self.pins.lock().expect("pin map poisoned");
            let entry = pins.get_mut(&pin).ok_or(GpioError::UnconfiguredPin(pin))?;
            let previous = entry.level;
            entry.level = level;
            previous
        };

        let handler = {
            let mut watches = self.watches.lock().expect("watch map poisoned");
            let Some(entry) = watches.get_mut(&pin) else {
                return Ok(false);
            };

            let matches = match entry.edge {
                EdgeKind::Rising => previous == Level::Low && level == Level::High,
                EdgeKind::Falling => previous == Level::High && level == Level::Low,
                EdgeKind::Both => previous != level,
            };
            if !matches {
                return Ok(false);
            }

            let now = Instant::now();
            if let Some(last) = entry.last_accepted {
                if now.duration_since(last) < entry.debounce {
                    debug!(pin, "mock edge suppressed by debounce window");
                    return Ok(false);
                }
            }

            // Confirmation read: the pin must still hold the event level.
            let confirmed = self
                .pins
                .lock()
                .expect("pin map poisoned")
                .get(&pin)
                .map(|e| e.level == level)
                .unwrap_or(false);
            if !confirmed {
                debug!(pin, "mock edge rejected by confirmation read");
                return Ok(false);
            }

            entry.last_accepted = Some(now);
            Arc::clone(&entry.handler)
        };

        handler(pin, level);
        Ok(true)
    }

    /// Snapshot of a PWM channel previously opened on `pin`.
    pub fn pwm_state(&self, pin: Pin) -> Option<MockPwmState> {
        self.pwms
            .lock()
            .expect("PWM map poisoned")
            .get(&pin)
            .map(|state| state.lock().expect("mock PWM state poisoned").clone())
    }

    /// Current level of any configured pin.
    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.pins
            .lock()
            .expect("pin map poisoned")
            .get(&pin)
            .map(|e| e.level)
    }

    fn notify_observers(&self, pin: Pin, level: Level) {
        let observers = self.observers.lock().expect("observer list poisoned");
        for observer in observers.iter() {
            observer(pin, level);
        }
    }
}

impl GpioBackend for MockGpio {
    fn configure(&self, pin: Pin, mode: PinMode, pull: Pull) -> GpioResult<()> {
        let initial = match (mode, pull) {
            (PinMode::Input, Pull::Up) => Level::High,
            _ => Level::Low,
        };
        self.pins
            .lock()
            .expect("pin map poisoned")
            .insert(pin, PinEntry {
                mode,
                level: initial,
            });
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> GpioResult<()> {
        {
            let mut pins = self.pins.lock().expect("pin map poisoned");
            let entry = pins.get_mut(&pin).ok_or(GpioError::UnconfiguredPin(pin))?;
            if entry.mode != PinMode::Output {
                return Err(GpioError::InvalidArgument(format!(
                    "pin {pin} is not an output"
                )));
            }
            entry.level = level;
        }
        // Observers run outside the pin-map lock so they may read pins or
        // inject edges.
        self.notify_observers(pin, level);
        Ok(())
    }

    fn read(&self, pin: Pin) -> GpioResult<Level> {
        self.pins
            .lock()
            .expect("pin map poisoned")
            .get(&pin)
            .map(|e| e.level)
            .ok_or(GpioError::UnconfiguredPin(pin))
    }

    fn watch(
        &self,
        pin: Pin,
        edge: EdgeKind,
        debounce: Duration,
        handler: EdgeHandler,
    ) -> GpioResult<()> {
        if !self.pins.lock().expect("pin map poisoned").contains_key(&pin) {
            return Err(GpioError::UnconfiguredPin(pin));
        }
        self.watches.lock().expect("watch map poisoned").insert(
            pin,
            WatchEntry {
                edge,
                debounce,
                handler,
                last_accepted: None,
            },
        );
        Ok(())
    }

    fn unwatch(&self, pin: Pin) -> GpioResult<()> {
        self.watches.lock().expect("watch map poisoned").remove(&pin);
        Ok(())
    }

    fn pwm(&self, pin: Pin, freq_hz: f64) -> GpioResult<Box<dyn PwmChannel>> {
        let freq = check_freq(freq_hz)?;
        let state = Arc::new(Mutex::new(MockPwmState::new(freq)));
        self.pwms
            .lock()
            .expect("PWM map poisoned")
            .insert(pin, Arc::clone(&state));
        Ok(Box::new(MockPwm { pin, state }))
    }

    fn cleanup(&self, pins: &[Pin]) -> GpioResult<()> {
        // Releasing a claim leaves the line high-impedance, so the pin
        // entry is removed rather than driven to a level. PWM history is
        // kept for post-mortem inspection, with the channel stopped.
        for &pin in pins {
            self.pins.lock().expect("pin map poisoned").remove(&pin);
            self.watches.lock().expect("watch map poisoned").remove(&pin);
            if let Some(state) = self.pwms.lock().expect("PWM map poisoned").get(&pin) {
                let mut state = state.lock().expect("mock PWM state poisoned");
                if state.running {
                    state.running = false;
                    state.apply(0.0);
                }
            }
        }
        Ok(())
    }
}
