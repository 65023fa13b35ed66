//! Typed configuration for the turret core.
//!
//! The core does not parse configuration files; the embedding binary
//! builds a [`TurretConfig`] (from its config layer of choice) and hands
//! it over once at startup. [`TurretConfig::validate`] runs the fatal
//! startup checks: pin uniqueness across the whole assignment, BCM range,
//! and value sanity.

use std::collections::HashSet;
use std::time::Duration;

use hardware::Pin;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurretError};
use crate::pid::PidGains;

/// BCM lines usable on the 40-pin header.
const VALID_BCM_PINS: std::ops::RangeInclusive<Pin> = 2..=27;

/// Allowed microstep resolutions for the MS-pin select table.
pub const VALID_MICROSTEPS: [u32; 5] = [1, 2, 4, 8, 16];

/// Limit switch pin assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinAssignment {
    pub x_cw_limit: Pin,
    pub x_ccw_limit: Pin,
    pub y_cw_limit: Pin,
    pub y_ccw_limit: Pin,
}

impl Default for PinAssignment {
    fn default() -> Self {
        Self {
            x_cw_limit: 18,
            x_ccw_limit: 21,
            y_cw_limit: 20,
            y_ccw_limit: 4,
        }
    }
}

/// Step/direction/enable lines for one motor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisPins {
    pub step: Pin,
    pub dir: Pin,
    pub enable: Pin,
}

/// Motor driver configuration shared by both axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorSettings {
    pub x: AxisPins,
    pub y: AxisPins,
    /// MS1/MS2/MS3 select lines, shared by both drivers. `None` when the
    /// drivers are configured over UART instead.
    pub microstep_pins: Option<[Pin; 3]>,
    pub microsteps: u32,
    pub steps_per_rev: u32,
    /// Steps to back away after a limit switch trips during homing.
    pub backoff_steps: u32,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            x: AxisPins {
                step: 23,
                dir: 19,
                enable: 5,
            },
            y: AxisPins {
                step: 24,
                dir: 26,
                enable: 6,
            },
            microstep_pins: Some([17, 27, 22]),
            microsteps: 8,
            steps_per_rev: 200,
            backoff_steps: 1,
        }
    }
}

/// Remote-control and motion pacing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    pub max_steps_per_update: u32,
    pub deadzone: f64,
    pub speed_scaling: f64,
    /// Minimum inter-step delay in seconds.
    pub step_delay_s: f64,
    pub acceleration_steps: u32,
    pub idle_timeout: Duration,
    pub home_timeout: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            max_steps_per_update: 50,
            deadzone: 5.0,
            speed_scaling: 0.10,
            step_delay_s: 0.0005,
            acceleration_steps: 50,
            idle_timeout: Duration::from_secs(120),
            home_timeout: Duration::from_secs(30),
        }
    }
}

/// Laser output parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserSettings {
    pub pin: Pin,
    pub pwm_freq_hz: f64,
    pub max_power_pct: u8,
    pub cooldown: Duration,
    /// Default pulse length for remote-triggered fires.
    pub pulse: Duration,
}

impl Default for LaserSettings {
    fn default() -> Self {
        Self {
            pin: 12,
            pwm_freq_hz: 1000.0,
            max_power_pct: 100,
            cooldown: Duration::from_millis(500),
            pulse: Duration::from_millis(100),
        }
    }
}

/// Camera-tracking defaults; the persisted calibration blob overrides
/// these when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSettings {
    pub dead_zone_pixels: u32,
    pub x_steps_per_pixel: f64,
    pub y_steps_per_pixel: f64,
    pub x_max_steps_from_home: u32,
    pub y_max_steps_from_home: u32,
    pub pid: PidGains,
    pub recenter_on_loss: bool,
    /// Steps emitted toward home per mover tick while recentering.
    pub home_recenter_rate: u32,
    pub loss_timeout: Duration,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            dead_zone_pixels: 20,
            x_steps_per_pixel: 0.1,
            y_steps_per_pixel: 0.1,
            x_max_steps_from_home: 2000,
            y_max_steps_from_home: 2000,
            pid: PidGains {
                kp: 1.0,
                ki: 0.0,
                kd: 0.0,
            },
            recenter_on_loss: false,
            home_recenter_rate: 5,
            loss_timeout: Duration::from_millis(500),
        }
    }
}

/// Complete turret configuration, ingested once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurretConfig {
    pub pins: PinAssignment,
    pub motor: MotorSettings,
    pub control: ControlSettings,
    pub laser: LaserSettings,
    pub tracking: TrackingSettings,
}

impl TurretConfig {
    /// Run the fatal startup checks.
    pub fn validate(&self) -> Result<()> {
        let mut assigned: HashSet<Pin> = HashSet::new();
        let mut claim = |pin: Pin, role: &str| -> Result<()> {
            if !VALID_BCM_PINS.contains(&pin) {
                return Err(TurretError::InvalidConfig(format!(
                    "{role} pin {pin} outside BCM range {}..={}",
                    VALID_BCM_PINS.start(),
                    VALID_BCM_PINS.end()
                )));
            }
            if !assigned.insert(pin) {
                return Err(TurretError::InvalidConfig(format!(
                    "pin {pin} assigned twice (second use: {role})"
                )));
            }
            Ok(())
        };

        claim(self.pins.x_cw_limit, "x CW limit")?;
        claim(self.pins.x_ccw_limit, "x CCW limit")?;
        claim(self.pins.y_cw_limit, "y CW limit")?;
        claim(self.pins.y_ccw_limit, "y CCW limit")?;
        claim(self.motor.x.step, "x step")?;
        claim(self.motor.x.dir, "x dir")?;
        claim(self.motor.x.enable, "x enable")?;
        claim(self.motor.y.step, "y step")?;
        claim(self.motor.y.dir, "y dir")?;
        claim(self.motor.y.enable, "y enable")?;
        if let Some(ms) = self.motor.microstep_pins {
            claim(ms[0], "MS1")?;
            claim(ms[1], "MS2")?;
            claim(ms[2], "MS3")?;
        }
        claim(self.laser.pin, "laser")?;

        if !VALID_MICROSTEPS.contains(&self.motor.microsteps) {
            return Err(TurretError::InvalidConfig(format!(
                "microsteps must be one of {VALID_MICROSTEPS:?}, got {}",
                self.motor.microsteps
            )));
        }
        if self.motor.steps_per_rev == 0 {
            return Err(TurretError::InvalidConfig(
                "steps_per_rev must be positive".into(),
            ));
        }
        if !(self.control.step_delay_s.is_finite() && self.control.step_delay_s > 0.0) {
            return Err(TurretError::InvalidConfig(format!(
                "step_delay_s must be positive, got {}",
                self.control.step_delay_s
            )));
        }
        if self.control.deadzone < 0.0 || self.control.deadzone >= 100.0 {
            return Err(TurretError::InvalidConfig(format!(
                "joystick deadzone must be in [0, 100), got {}",
                self.control.deadzone
            )));
        }
        if self.control.speed_scaling <= 0.0 {
            return Err(TurretError::InvalidConfig(
                "speed_scaling must be positive".into(),
            ));
        }
        if self.laser.max_power_pct > 100 {
            return Err(TurretError::InvalidConfig(format!(
                "laser max_power_pct must be at most 100, got {}",
                self.laser.max_power_pct
            )));
        }
        if self.tracking.x_steps_per_pixel <= 0.0 || self.tracking.y_steps_per_pixel <= 0.0 {
            return Err(TurretError::InvalidConfig(
                "steps-per-pixel must be positive".into(),
            ));
        }
        if self.tracking.x_max_steps_from_home == 0 || self.tracking.y_max_steps_from_home == 0 {
            return Err(TurretError::InvalidConfig(
                "max steps from home must be positive".into(),
            ));
        }
        if self.tracking.home_recenter_rate == 0 {
            return Err(TurretError::InvalidConfig(
                "home_recenter_rate must be positive".into(),
            ));
        }
        self.tracking.pid.validate()?;
        Ok(())
    }
}
