//! GPIO and PWM abstraction consumed by the turret core.
//!
//! Every motion and laser component talks to hardware through the
//! [`GpioBackend`] trait so the same control logic runs against the real
//! Raspberry Pi header (`rpi` module, `raspi` feature) or the in-memory
//! [`MockGpio`](crate::mock::MockGpio) used by the test suites.
//!
//! Edge watchers invoke their handlers from a backend-owned dispatcher
//! thread. Handlers must be non-blocking: record the event and return.
//! Debouncing is the backend's responsibility, not the handler's.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// BCM pin number.
pub type Pin = u8;

/// Direction a GPIO line is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

/// Internal pull resistor selection for input lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

/// Edge polarity for event watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
    Both,
}

/// Logic level of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_low(self) -> bool {
        self == Level::Low
    }

    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Errors produced by GPIO backends.
#[derive(Error, Debug)]
pub enum GpioError {
    /// Caller passed a value the backend cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation on a pin that was never configured.
    #[error("pin {0} is not configured")]
    UnconfiguredPin(Pin),

    /// Underlying device I/O failed.
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    /// The backend does not provide this capability on this pin.
    #[error("{0} not supported by this backend")]
    Unsupported(&'static str),
}

/// Result type for GPIO operations.
pub type GpioResult<T> = Result<T, GpioError>;

/// Callback invoked when a watched edge fires.
///
/// Runs on the backend's dispatcher thread; implementations only set flags.
pub type EdgeHandler = Arc<dyn Fn(Pin, Level) + Send + Sync>;

/// One PWM output channel.
///
/// Duty cycles are percentages. Values above 100 are clamped at the
/// boundary; negative or non-finite input is rejected with
/// [`GpioError::InvalidArgument`].
pub trait PwmChannel: Send {
    fn start(&mut self, duty_pct: f64) -> GpioResult<()>;
    fn set_duty(&mut self, duty_pct: f64) -> GpioResult<()>;
    fn set_freq(&mut self, freq_hz: f64) -> GpioResult<()>;
    fn stop(&mut self) -> GpioResult<()>;

    /// Current duty cycle in percent (0 when stopped).
    fn duty(&self) -> f64;
}

/// Hardware-neutral GPIO capability set.
///
/// One backend instance is constructed at process start and shared by
/// reference; each pin is owned by exactly one component after
/// configuration.
pub trait GpioBackend: Send + Sync {
    /// Configure a pin's direction and pull resistor.
    fn configure(&self, pin: Pin, mode: PinMode, pull: Pull) -> GpioResult<()>;

    /// Drive an output pin.
    fn write(&self, pin: Pin, level: Level) -> GpioResult<()>;

    /// Sample an input pin.
    fn read(&self, pin: Pin) -> GpioResult<Level>;

    /// Watch a pin for edges, applying `debounce` suppression inside the
    /// backend before `handler` is invoked.
    fn watch(
        &self,
        pin: Pin,
        edge: EdgeKind,
        debounce: Duration,
        handler: EdgeHandler,
    ) -> GpioResult<()>;

    /// Remove an edge watch installed by [`watch`](Self::watch).
    fn unwatch(&self, pin: Pin) -> GpioResult<()>;

    /// Open a PWM channel on a pin.
    fn pwm(&self, pin: Pin, freq_hz: f64) -> GpioResult<Box<dyn PwmChannel>>;

    /// Release the given pins: outputs driven low, watches removed, PWM
    /// stopped. Idempotent; releasing an unknown pin is not an error.
    fn cleanup(&self, pins: &[Pin]) -> GpioResult<()>;
}

/// Validate and clamp a requested duty cycle.
pub(crate) fn clamp_duty(duty_pct: f64) -> GpioResult<f64> {
    if !duty_pct.is_finite() || duty_pct < 0.0 {
        return Err(GpioError::InvalidArgument(format!(
            "duty cycle must be a finite value in [0, 100], got {duty_pct}"
        )));
    }
    Ok(duty_pct.min(100.0))
}

/// Validate a PWM frequency.
pub(crate) fn check_freq(freq_hz: f64) -> GpioResult<f64> {
    if !freq_hz.is_finite() || freq_hz <= 0.0 {
        return Err(GpioError::InvalidArgument(format!(
            "PWM frequency must be positive, got {freq_hz}"
        )));
    }
    Ok(freq_hz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_clamps_high_values() {
        assert_eq!(clamp_duty(150.0).unwrap(), 100.0);
        assert_eq!(clamp_duty(100.0).unwrap(), 100.0);
        assert_eq!(clamp_duty(42.5).unwrap(), 42.5);
    }

    #[test]
    fn duty_rejects_negative_and_nan() {
        assert!(clamp_duty(-0.1).is_err());
        assert!(clamp_duty(f64::NAN).is_err());
        assert!(clamp_duty(f64::INFINITY).is_err());
    }

    #[test]
    fn freq_rejects_non_positive() {
        assert!(check_freq(0.0).is_err());
        assert!(check_freq(-5.0).is_err());
        assert!(check_freq(1000.0).is_ok());
    }
}
