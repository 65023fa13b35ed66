//! Laser power control and safety interlocks.
//!
//! [`LaserOutput`] owns the PWM channel and clamps every duty request to
//! the configured power ceiling. [`LaserSafetyController`] layers the
//! arm/disarm state machine, cooldown timer and pulse/burst sequencing on
//! top, guaranteeing the duty cycle is zero on every exit path.
//!
//! Pulse sequences run on a worker thread so a disarm issued mid-burst
//! takes effect at the next inter-pulse boundary; the pulse in progress
//! completes (its tail is cut by the disarm forcing duty to zero).

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hardware::{GpioBackend, Level, Pin, PinMode, PwmChannel, Pull};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::config::LaserSettings;
use crate::error::{Result, TurretError};

/// Hard cap on a single pulse, whatever the caller asked for.
pub const MAX_FIRE_DURATION: Duration = Duration::from_secs(5);

/// PWM wrapper with the power ceiling applied at the boundary.
pub struct LaserOutput {
    pwm: Box<dyn PwmChannel>,
    max_power_pct: u8,
}

impl LaserOutput {
    pub fn new(gpio: &Arc<dyn GpioBackend>, pin: Pin, settings: &LaserSettings) -> Result<Self> {
        gpio.configure(pin, PinMode::Output, Pull::None)?;
        gpio.write(pin, Level::Low)?;
        let mut pwm = gpio.pwm(pin, settings.pwm_freq_hz)?;
        pwm.start(0.0)?;
        info!(
            "laser output on pin {pin} at {} Hz, ceiling {}%",
            settings.pwm_freq_hz, settings.max_power_pct
        );
        Ok(Self {
            pwm,
            max_power_pct: settings.max_power_pct,
        })
    }

    /// Clamp a requested power level to the configured ceiling.
    pub fn clamp_power(&self, pct: u8) -> u8 {
        pct.min(self.max_power_pct)
    }

    fn set_duty(&mut self, pct: u8) -> Result<()> {
        let clamped = self.clamp_power(pct);
        self.pwm.set_duty(clamped as f64)?;
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.pwm.duty() > 0.0
    }

    fn stop(&mut self) -> Result<()> {
        self.pwm.stop()?;
        Ok(())
    }
}

/// Telemetry snapshot of the laser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserState {
    pub armed: bool,
    pub power_pct: u8,
    pub is_on: bool,
    pub fire_count: u64,
    pub cooldown_remaining_ms: u64,
    pub dry_run: bool,
}

struct FireState {
    armed: bool,
    power_pct: u8,
    fire_count: u64,
    cooldown_until: Option<Instant>,
    dry_run: bool,
    busy: bool,
    sequence_cancel: CancelToken,
}

struct LaserShared {
    output: Mutex<LaserOutput>,
    state: Mutex<FireState>,
    idle: Condvar,
    cooldown: Duration,
}

/// Arm/disarm state machine and fire sequencing.
pub struct LaserSafetyController {
    shared: Arc<LaserShared>,
    pin: Pin,
}

impl LaserSafetyController {
    pub fn new(gpio: &Arc<dyn GpioBackend>, settings: &LaserSettings) -> Result<Self> {
        let output = LaserOutput::new(gpio, settings.pin, settings)?;
        Ok(Self {
            shared: Arc::new(LaserShared {
                output: Mutex::new(output),
                state: Mutex::new(FireState {
                    armed: false,
                    power_pct: 0,
                    fire_count: 0,
                    cooldown_until: None,
                    dry_run: false,
                    busy: false,
                    sequence_cancel: CancelToken::new(),
                }),
                idle: Condvar::new(),
                cooldown: settings.cooldown,
            }),
            pin: settings.pin,
        })
    }

    /// Master enable. Disarming forces the duty cycle to zero immediately
    /// and cancels an in-flight burst at its next pulse boundary.
    pub fn arm(&self, enable: bool) {
        let cancel = {
            let mut state = self.shared.state.lock().expect("laser state poisoned");
            state.armed = enable;
            if enable {
                None
            } else {
                Some(state.sequence_cancel.clone())
            }
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
            let mut output = self.shared.output.lock().expect("laser output poisoned");
            if let Err(err) = output.set_duty(0) {
                error!("failed to force laser off on disarm: {err}");
            }
            info!("laser disarmed");
        } else {
            info!("laser armed");
        }
    }

    /// Visual-test mode: sequences and counters run, the beam stays off.
    pub fn set_dry_run(&self, enable: bool) {
        self.shared.state.lock().expect("laser state poisoned").dry_run = enable;
        info!("laser dry-run {}", if enable { "on" } else { "off" });
    }

    /// Set the power level, clamped to the configured ceiling.
    pub fn set_power(&self, pct: u8) -> u8 {
        let clamped = self
            .shared
            .output
            .lock()
            .expect("laser output poisoned")
            .clamp_power(pct);
        self.shared.state.lock().expect("laser state poisoned").power_pct = clamped;
        debug!("laser power set to {clamped}%");
        clamped
    }

    pub fn reset_fire_count(&self) {
        self.shared.state.lock().expect("laser state poisoned").fire_count = 0;
    }

    /// Single pulse of up to [`MAX_FIRE_DURATION`].
    pub fn fire(&self, duration: Duration) -> Result<()> {
        self.start_sequence(1, duration.min(MAX_FIRE_DURATION), Duration::ZERO)
    }

    /// `count` pulses separated by `off` gaps; cooldown starts after the
    /// final on-cycle.
    pub fn burst(&self, count: u32, on: Duration, off: Duration) -> Result<()> {
        if count == 0 {
            return Err(TurretError::Malformed("burst of zero pulses".into()));
        }
        self.start_sequence(count, on.min(MAX_FIRE_DURATION), off)
    }

    fn start_sequence(&self, count: u32, on: Duration, off: Duration) -> Result<()> {
        let (cancel, power, dry_run) = {
            let mut state = self.shared.state.lock().expect("laser state poisoned");
            if state.busy {
                return Err(TurretError::Busy);
            }
            if !state.armed && !state.dry_run {
                return Err(TurretError::Disarmed);
            }
            if let Some(until) = state.cooldown_until {
                if Instant::now() < until {
                    return Err(TurretError::Cooldown);
                }
            }
            state.busy = true;
            state.sequence_cancel = CancelToken::new();
            (
                state.sequence_cancel.clone(),
                state.power_pct,
                state.dry_run,
            )
        };

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("laser-fire".into())
            .spawn(move || run_sequence(shared, count, on, off, power, dry_run, cancel))
            .map_err(|err| {
                let mut state = self.shared.state.lock().expect("laser state poisoned");
                state.busy = false;
                TurretError::Hardware(format!("spawning laser worker: {err}"))
            })?;
        Ok(())
    }

    /// Full laser state for telemetry.
    pub fn status(&self) -> LaserState {
        let is_on = self
            .shared
            .output
            .lock()
            .expect("laser output poisoned")
            .is_on();
        let state = self.shared.state.lock().expect("laser state poisoned");
        let cooldown_remaining_ms = state
            .cooldown_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        LaserState {
            armed: state.armed,
            power_pct: state.power_pct,
            is_on,
            fire_count: state.fire_count,
            cooldown_remaining_ms,
            dry_run: state.dry_run,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().expect("laser state poisoned").armed
    }

    /// Block until no pulse sequence is in flight.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.state.lock().expect("laser state poisoned");
        let (state, result) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |s| s.busy)
            .expect("laser state poisoned");
        drop(state);
        !result.timed_out()
    }

    /// Tear down: cancel sequencing, force the beam off, stop PWM.
    pub fn shutdown(&self) {
        {
            let state = self.shared.state.lock().expect("laser state poisoned");
            state.sequence_cancel.cancel();
        }
        self.wait_idle(MAX_FIRE_DURATION + Duration::from_millis(100));
        let mut output = self.shared.output.lock().expect("laser output poisoned");
        if let Err(err) = output.set_duty(0) {
            warn!("laser duty not cleared during shutdown: {err}");
        }
        if let Err(err) = output.stop() {
            warn!("laser PWM not stopped during shutdown: {err}");
        }
    }

    pub fn pin(&self) -> Pin {
        self.pin
    }
}

/// Worker-side pulse loop. Cancellation is checked between pulses; the
/// pulse in progress finishes its timing before inspection.
fn run_sequence(
    shared: Arc<LaserShared>,
    count: u32,
    on: Duration,
    off: Duration,
    power: u8,
    dry_run: bool,
    cancel: CancelToken,
) {
    let mut hardware_fault = false;
    for pulse in 0..count {
        if cancel.is_cancelled() {
            info!("laser sequence cancelled after {pulse} pulse(s)");
            break;
        }
        if !dry_run {
            let mut output = shared.output.lock().expect("laser output poisoned");
            if let Err(err) = output.set_duty(power) {
                error!("laser pulse aborted: {err}");
                hardware_fault = true;
                break;
            }
        } else {
            debug!("dry-run pulse {} of {count}", pulse + 1);
        }
        thread::sleep(on);
        {
            let mut output = shared.output.lock().expect("laser output poisoned");
            if let Err(err) = output.set_duty(0) {
                error!("laser duty not cleared after pulse: {err}");
                hardware_fault = true;
            }
        }
        shared.state.lock().expect("laser state poisoned").fire_count += 1;

        if pulse + 1 < count && !cancel.is_cancelled() {
            thread::sleep(off);
        }
    }

    // Every exit path leaves the duty cycle at zero.
    {
        let mut output = shared.output.lock().expect("laser output poisoned");
        if let Err(err) = output.set_duty(0) {
            error!("laser duty not cleared at sequence end: {err}");
        }
    }

    let mut state = shared.state.lock().expect("laser state poisoned");
    state.cooldown_until = Some(Instant::now() + shared.cooldown);
    state.busy = false;
    if hardware_fault {
        state.armed = false;
        warn!("laser disarmed after hardware fault");
    }
    drop(state);
    shared.idle.notify_all();
}
