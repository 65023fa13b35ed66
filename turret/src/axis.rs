//! Single-axis stepper driver: step/dir/enable pulse generation with a
//! trapezoidal speed profile, limit-switch interlocks and position
//! accounting.
//!
//! Limit switches are watched through the GPIO backend with a 100 ms
//! debounce; the edge handlers only set per-direction atomic flags. The
//! step loop observes those flags between pulses, so a pulse in progress
//! always completes before the interlock takes effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hardware::{EdgeKind, GpioBackend, Level, Pin, PinMode, Pull};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{Result, TurretError};

/// Debounce window applied to limit switch edges.
pub const LIMIT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Direction line setup time before the first pulse.
const DIR_SETUP: Duration = Duration::from_micros(2);

/// Minimum step pulse width.
const PULSE_WIDTH: Duration = Duration::from_micros(2);

/// A single pulse whose GPIO writes take longer than
/// `min_delay * STALL_MULTIPLIER` indicates wedged hardware.
const STALL_MULTIPLIER: f64 = 50.0;

/// Upper bound on pulses emitted while seeking a limit switch, in case the
/// switch never fires and the deadline clock is very generous.
const HOME_STEP_CAP: u32 = 1_000_000;

/// MS1/MS2/MS3 levels for A4988/DRV8825-style drivers.
const MICROSTEP_TABLE: [(u32, [bool; 3]); 5] = [
    (1, [false, false, false]),
    (2, [true, false, false]),
    (4, [false, true, false]),
    (8, [true, true, false]),
    (16, [true, true, true]),
];

/// Rotation direction. CW increases `position`, CCW decreases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Cw,
    Ccw,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Cw => Direction::Ccw,
            Direction::Ccw => Direction::Cw,
        }
    }

    fn position_delta(self) -> i64 {
        match self {
            Direction::Cw => 1,
            Direction::Ccw => -1,
        }
    }

    fn dir_level(self) -> Level {
        match self {
            Direction::Cw => Level::High,
            Direction::Ccw => Level::Low,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Direction::Cw => "CW",
            Direction::Ccw => "CCW",
        })
    }
}

/// Faults that latch an axis into the `Error` status until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisFault {
    Timeout,
    Hardware,
}

/// Externally visible axis status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisStatus {
    Idle,
    Moving,
    Homing,
    LimitReached(Direction),
    Error(AxisFault),
}

/// Why a step call stopped emitting pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTermination {
    Completed,
    LimitHit,
    Cancelled,
}

/// Result of a bounded motion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub steps_emitted: u32,
    pub terminated_by: StepTermination,
}

/// Immutable per-axis configuration.
#[derive(Debug, Clone)]
pub struct AxisConfig {
    pub name: &'static str,
    pub step_pin: Pin,
    pub dir_pin: Pin,
    pub enable_pin: Pin,
    pub cw_limit_pin: Pin,
    pub ccw_limit_pin: Pin,
    /// Shared MS select lines; applied at setup when present, absent when
    /// the driver is configured over UART.
    pub microstep_pins: Option<[Pin; 3]>,
    pub steps_per_rev: u32,
    pub microsteps: u32,
    /// Minimum inter-step delay in seconds.
    pub step_delay_s: f64,
    pub acceleration_steps: u32,
    pub backoff_steps: u32,
    pub home_timeout: Duration,
}

struct AxisState {
    position: i64,
    status: AxisStatus,
    last_direction: Option<Direction>,
}

struct AxisShared {
    state: Mutex<AxisState>,
    cw_limit: AtomicBool,
    ccw_limit: AtomicBool,
}

/// One pan or tilt motor.
pub struct StepperAxis {
    gpio: Arc<dyn GpioBackend>,
    cfg: AxisConfig,
    shared: Arc<AxisShared>,
    enabled: AtomicBool,
    /// Serializes pulse emission; held for the whole of `step` and `home`.
    motion: Mutex<()>,
}

impl StepperAxis {
    /// Configure the axis pins and install the limit switch watches.
    pub fn new(gpio: Arc<dyn GpioBackend>, cfg: AxisConfig) -> Result<Self> {
        gpio.configure(cfg.step_pin, PinMode::Output, Pull::None)?;
        gpio.configure(cfg.dir_pin, PinMode::Output, Pull::None)?;
        gpio.configure(cfg.enable_pin, PinMode::Output, Pull::None)?;
        // Enable is active-low; start released.
        gpio.write(cfg.enable_pin, Level::High)?;

        if let Some(ms_pins) = cfg.microstep_pins {
            let levels = MICROSTEP_TABLE
                .iter()
                .find(|(res, _)| *res == cfg.microsteps)
                .map(|(_, levels)| *levels)
                .ok_or_else(|| {
                    TurretError::InvalidConfig(format!(
                        "unsupported microstep resolution {}",
                        cfg.microsteps
                    ))
                })?;
            for (pin, high) in ms_pins.iter().zip(levels) {
                gpio.configure(*pin, PinMode::Output, Pull::None)?;
                gpio.write(*pin, Level::from(high))?;
            }
            debug!("[{}] microstepping set to 1/{}", cfg.name, cfg.microsteps);
        }

        let shared = Arc::new(AxisShared {
            state: Mutex::new(AxisState {
                position: 0,
                status: AxisStatus::Idle,
                last_direction: None,
            }),
            cw_limit: AtomicBool::new(false),
            ccw_limit: AtomicBool::new(false),
        });

        for (pin, direction) in [
            (cfg.cw_limit_pin, Direction::Cw),
            (cfg.ccw_limit_pin, Direction::Ccw),
        ] {
            gpio.configure(pin, PinMode::Input, Pull::Up)?;
            let flags = Arc::clone(&shared);
            let name = cfg.name;
            gpio.watch(
                pin,
                EdgeKind::Falling,
                LIMIT_DEBOUNCE,
                Arc::new(move |_, _| {
                    // Flag-set only; the step loop reacts between pulses.
                    match direction {
                        Direction::Cw => flags.cw_limit.store(true, Ordering::SeqCst),
                        Direction::Ccw => flags.ccw_limit.store(true, Ordering::SeqCst),
                    }
                    info!("[{name}] {direction} limit switch triggered");
                }),
            )?;
        }

        Ok(Self {
            gpio,
            cfg,
            shared,
            enabled: AtomicBool::new(false),
            motion: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &AxisConfig {
        &self.cfg
    }

    pub fn position(&self) -> i64 {
        self.shared.state.lock().expect("axis state poisoned").position
    }

    /// Current status, folding in a limit flag raised while idle.
    pub fn status(&self) -> AxisStatus {
        let state = self.shared.state.lock().expect("axis state poisoned");
        if state.status == AxisStatus::Idle {
            if let Some(direction) = self.triggered_limit() {
                return AxisStatus::LimitReached(direction);
            }
        }
        state.status
    }

    pub fn last_direction(&self) -> Option<Direction> {
        self.shared
            .state
            .lock()
            .expect("axis state poisoned")
            .last_direction
    }

    /// Position, status and last direction under one lock acquisition, so
    /// telemetry sees a consistent view.
    pub fn observe(&self) -> (i64, AxisStatus, Option<Direction>) {
        let state = self.shared.state.lock().expect("axis state poisoned");
        let status = match (state.status, self.triggered_limit()) {
            (AxisStatus::Idle, Some(direction)) => AxisStatus::LimitReached(direction),
            (status, _) => status,
        };
        (state.position, status, state.last_direction)
    }

    /// Which limit switch is currently latched, if any.
    pub fn triggered_limit(&self) -> Option<Direction> {
        if self.shared.cw_limit.load(Ordering::SeqCst) {
            Some(Direction::Cw)
        } else if self.shared.ccw_limit.load(Ordering::SeqCst) {
            Some(Direction::Ccw)
        } else {
            None
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Assert the (active-low) enable line.
    pub fn enable(&self) -> Result<()> {
        self.gpio.write(self.cfg.enable_pin, Level::Low)?;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Release the motor: enable line inactive, holding torque gone.
    pub fn release(&self) -> Result<()> {
        self.gpio.write(self.cfg.enable_pin, Level::High)?;
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Zero the position without moving.
    pub fn set_home_here(&self) {
        let mut state = self.shared.state.lock().expect("axis state poisoned");
        state.position = 0;
        info!("[{}] home set at current position", self.cfg.name);
    }

    /// Clear a latched `Error` status.
    pub fn clear_fault(&self) {
        let mut state = self.shared.state.lock().expect("axis state poisoned");
        if matches!(state.status, AxisStatus::Error(_)) {
            state.status = AxisStatus::Idle;
        }
    }

    fn limit_flag(&self, direction: Direction) -> &AtomicBool {
        match direction {
            Direction::Cw => &self.shared.cw_limit,
            Direction::Ccw => &self.shared.ccw_limit,
        }
    }

    fn set_status(&self, status: AxisStatus) {
        self.shared.state.lock().expect("axis state poisoned").status = status;
    }

    /// Point the direction line and clear the limit latched on the side we
    /// are moving away from.
    fn set_direction(&self, direction: Direction) -> Result<()> {
        self.gpio.write(self.cfg.dir_pin, direction.dir_level())?;
        self.limit_flag(direction.opposite())
            .store(false, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock().expect("axis state poisoned");
            state.last_direction = Some(direction);
        }
        spin_wait(DIR_SETUP);
        Ok(())
    }

    /// Emit one step pulse and update the position. The stall budget only
    /// covers the GPIO writes, not the commanded inter-step sleep.
    fn emit_pulse(&self, direction: Direction, delay_s: f64, stall_budget: Duration) -> Result<()> {
        let started = Instant::now();
        self.write_or_fault(self.cfg.step_pin, Level::High)?;
        spin_wait(PULSE_WIDTH);
        self.write_or_fault(self.cfg.step_pin, Level::Low)?;
        if started.elapsed() > stall_budget {
            warn!("[{}] step pulse exceeded stall budget", self.cfg.name);
            self.fault(AxisFault::Timeout);
            return Err(TurretError::Timeout("step pulse"));
        }

        {
            let mut state = self.shared.state.lock().expect("axis state poisoned");
            state.position += direction.position_delta();
        }

        let sleep = Duration::from_secs_f64(delay_s).saturating_sub(PULSE_WIDTH);
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
        Ok(())
    }

    fn write_or_fault(&self, pin: Pin, level: Level) -> Result<()> {
        self.gpio.write(pin, level).map_err(|err| {
            self.fault(AxisFault::Hardware);
            TurretError::Hardware(err.to_string())
        })
    }

    /// Leave the axis safe after a fault: enable released, status latched.
    fn fault(&self, fault: AxisFault) {
        let _ = self.gpio.write(self.cfg.enable_pin, Level::High);
        self.enabled.store(false, Ordering::SeqCst);
        self.set_status(AxisStatus::Error(fault));
    }

    /// Bounded relative motion with the trapezoidal profile.
    ///
    /// Returns how many pulses were emitted and why emission stopped. A
    /// direction whose limit is latched produces `(0, LimitHit)` without
    /// touching the step line.
    pub fn step(
        &self,
        direction: Direction,
        count: u32,
        min_delay_s: f64,
        cancel: &CancelToken,
    ) -> Result<StepOutcome> {
        let _guard = self.motion.lock().expect("axis motion lock poisoned");

        if let AxisStatus::Error(_) = self.status() {
            return Err(TurretError::Hardware(format!(
                "axis {} is in a fault state",
                self.cfg.name
            )));
        }

        if self.limit_flag(direction).load(Ordering::SeqCst) {
            debug!("[{}] {direction} step refused, limit latched", self.cfg.name);
            return Ok(StepOutcome {
                steps_emitted: 0,
                terminated_by: StepTermination::LimitHit,
            });
        }
        if count == 0 {
            return Ok(StepOutcome {
                steps_emitted: 0,
                terminated_by: StepTermination::Completed,
            });
        }

        self.set_direction(direction)?;
        self.set_status(AxisStatus::Moving);
        let stall_budget = Duration::from_secs_f64(min_delay_s * STALL_MULTIPLIER);

        let mut emitted = 0u32;
        let mut terminated_by = StepTermination::Completed;
        let result = loop {
            if emitted == count {
                break Ok(());
            }
            if self.limit_flag(direction).load(Ordering::SeqCst) {
                terminated_by = StepTermination::LimitHit;
                break Ok(());
            }
            if cancel.is_cancelled() {
                terminated_by = StepTermination::Cancelled;
                break Ok(());
            }
            let delay = profile_delay(emitted, count, self.cfg.acceleration_steps, min_delay_s);
            if let Err(err) = self.emit_pulse(direction, delay, stall_budget) {
                break Err(err);
            }
            emitted += 1;
        };

        match &result {
            Ok(()) => {
                let status = if terminated_by == StepTermination::LimitHit {
                    AxisStatus::LimitReached(direction)
                } else {
                    AxisStatus::Idle
                };
                self.set_status(status);
            }
            Err(_) => {
                // emit_pulse already latched the fault status.
            }
        }
        result.map(|()| StepOutcome {
            steps_emitted: emitted,
            terminated_by,
        })
    }

    /// Home against both limit switches.
    ///
    /// Seeks the CCW stop, backs off, sweeps to the CW stop while counting
    /// the full travel, then centers and zeroes the position. Returns the
    /// measured travel in steps.
    pub fn home(&self, cancel: &CancelToken) -> Result<u32> {
        let _guard = self.motion.lock().expect("axis motion lock poisoned");
        let deadline = Instant::now() + self.cfg.home_timeout;
        self.set_status(AxisStatus::Homing);
        info!("[{}] homing started", self.cfg.name);

        let result = self.home_sequence(cancel, deadline);
        match &result {
            Ok(travel) => {
                let mut state = self.shared.state.lock().expect("axis state poisoned");
                state.position = 0;
                state.status = AxisStatus::Idle;
                info!("[{}] homing complete, travel {travel} steps", self.cfg.name);
            }
            Err(TurretError::Timeout(_)) => {
                self.fault(AxisFault::Timeout);
            }
            Err(TurretError::Cancelled) => {
                self.set_status(AxisStatus::Idle);
            }
            Err(_) => {}
        }
        result
    }

    fn home_sequence(&self, cancel: &CancelToken, deadline: Instant) -> Result<u32> {
        let delay = self.cfg.step_delay_s;

        self.seek_limit(Direction::Ccw, delay, cancel, deadline)?;
        self.run_steps(Direction::Cw, self.cfg.backoff_steps, delay, cancel, deadline)?;
        let travel = self.seek_limit(Direction::Cw, delay, cancel, deadline)?;
        self.run_steps(Direction::Ccw, travel / 2, delay, cancel, deadline)?;
        Ok(travel)
    }

    /// Step toward `direction` until its limit switch latches, returning
    /// the number of pulses emitted on the way.
    fn seek_limit(
        &self,
        direction: Direction,
        delay_s: f64,
        cancel: &CancelToken,
        deadline: Instant,
    ) -> Result<u32> {
        let stall_budget = Duration::from_secs_f64(delay_s * STALL_MULTIPLIER);
        self.set_direction(direction)?;
        let mut emitted = 0u32;
        while !self.limit_flag(direction).load(Ordering::SeqCst) {
            if cancel.is_cancelled() {
                return Err(TurretError::Cancelled);
            }
            if Instant::now() > deadline || emitted >= HOME_STEP_CAP {
                return Err(TurretError::Timeout("homing"));
            }
            self.emit_pulse(direction, delay_s, stall_budget)?;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Emit a fixed number of pulses during homing, honoring the same
    /// cancellation and deadline rules as the seek phases.
    fn run_steps(
        &self,
        direction: Direction,
        count: u32,
        delay_s: f64,
        cancel: &CancelToken,
        deadline: Instant,
    ) -> Result<()> {
        let stall_budget = Duration::from_secs_f64(delay_s * STALL_MULTIPLIER);
        self.set_direction(direction)?;
        for _ in 0..count {
            if self.limit_flag(direction).load(Ordering::SeqCst) {
                break;
            }
            if cancel.is_cancelled() {
                return Err(TurretError::Cancelled);
            }
            if Instant::now() > deadline {
                return Err(TurretError::Timeout("homing"));
            }
            self.emit_pulse(direction, delay_s, stall_budget)?;
        }
        Ok(())
    }

    /// Pins owned by this axis, for teardown.
    pub fn pins(&self) -> Vec<Pin> {
        let mut pins = vec![
            self.cfg.step_pin,
            self.cfg.dir_pin,
            self.cfg.enable_pin,
            self.cfg.cw_limit_pin,
            self.cfg.ccw_limit_pin,
        ];
        if let Some(ms) = self.cfg.microstep_pins {
            pins.extend(ms);
        }
        pins
    }
}

/// Trapezoidal inter-step delay: ramp from `4 * min_delay` down to
/// `min_delay` over the first `accel` steps, with a symmetric ramp at the
/// end; triangular around the midpoint for short moves.
fn profile_delay(index: u32, count: u32, accel: u32, min_delay: f64) -> f64 {
    let accel = accel.min(count / 2);
    if accel == 0 {
        return min_delay;
    }
    let remaining = count - index;
    if index < accel {
        let ratio = (index + 1) as f64 / accel as f64;
        min_delay * (4.0 - 3.0 * ratio)
    } else if remaining <= accel {
        let ratio = remaining as f64 / accel as f64;
        min_delay * (4.0 - 3.0 * ratio)
    } else {
        min_delay
    }
}

/// Busy-wait for sub-scheduler-quantum delays (direction setup, pulse
/// width); `thread::sleep` overshoots these by orders of magnitude.
fn spin_wait(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}
