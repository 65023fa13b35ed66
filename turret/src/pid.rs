//! Dual-axis PID compensator for pixel-error tracking.
//!
//! One [`PidAxis`] per motion axis, updated by the mover with the latest
//! detector sample. Inputs are pixel errors relative to the frame center;
//! outputs are corrections in pixel units which the tracking controller
//! converts to steps.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurretError};

/// Shortest sample interval accepted for derivative/integral updates.
const DT_MIN_S: f64 = 0.001;
/// Samples further apart than this are treated as a fresh start: the
/// interval is clipped and the derivative term suppressed.
const DT_MAX_S: f64 = 0.200;

/// Proportional/integral/derivative gains, shared across both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("kp", self.kp), ("ki", self.ki), ("kd", self.kd)] {
            if !value.is_finite() || value < 0.0 {
                return Err(TurretError::InvalidConfig(format!(
                    "PID gain {name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Integral clamp for a given travel bound. Disabled when `ki` is zero.
    pub fn integral_limit(&self, max_steps_from_home: u32) -> Option<f64> {
        if self.ki <= 0.0 {
            return None;
        }
        let bound = max_steps_from_home as f64;
        Some(if self.kp > 0.0 { bound / self.kp } else { bound })
    }
}

/// State for one axis of the compensator.
#[derive(Debug, Clone, Default)]
pub struct PidAxis {
    last_error: f64,
    integral: f64,
    last_ts: Option<Instant>,
}

impl PidAxis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear accumulated state. Called on mode change, homing, target
    /// loss, and dead-zone hits.
    pub fn reset(&mut self) {
        self.last_error = 0.0;
        self.integral = 0.0;
        self.last_ts = None;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Run one compensator step, returning the output in pixel units.
    pub fn update(&mut self, error: f64, ts: Instant, gains: &PidGains, i_max: Option<f64>) -> f64 {
        let raw_dt = self
            .last_ts
            .map(|last| ts.saturating_duration_since(last).as_secs_f64());
        let dt = raw_dt.unwrap_or(DT_MIN_S).clamp(DT_MIN_S, DT_MAX_S);
        // A missing or stale previous sample gives no usable slope.
        let derivative_valid = matches!(raw_dt, Some(d) if d < DT_MAX_S);

        self.integral += error * dt;
        if let Some(limit) = i_max {
            self.integral = self.integral.clamp(-limit, limit);
        } else if gains.ki <= 0.0 {
            self.integral = 0.0;
        }

        let derivative = if derivative_valid {
            (error - self.last_error) / dt
        } else {
            0.0
        };

        let output = gains.kp * error + gains.ki * self.integral + gains.kd * derivative;

        self.last_error = error;
        self.last_ts = Some(ts);
        output
    }
}
