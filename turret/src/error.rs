use thiserror::Error;

use crate::axis::Direction;
use crate::state::TrackerMode;

/// Errors produced by the turret motion and targeting core.
#[derive(Error, Debug)]
pub enum TurretError {
    /// Configuration rejected at startup; fatal.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// GPIO or PWM I/O failed; the affected component has been left safe.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// The requested direction is blocked by a triggered limit switch.
    #[error("{0} motion blocked by triggered limit switch")]
    LimitBlocked(Direction),

    /// Command incompatible with the current tracker mode.
    #[error("command not available in {0} mode")]
    ModeDisabled(TrackerMode),

    /// Laser fire refused while cooling down.
    #[error("laser cooling down")]
    Cooldown,

    /// Laser fire refused while disarmed.
    #[error("laser is disarmed")]
    Disarmed,

    /// Laser fire refused while a burst is in flight.
    #[error("laser busy")]
    Busy,

    /// A bounded operation exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// External input failed validation and was dropped.
    #[error("malformed input: {0}")]
    Malformed(String),
}

impl From<hardware::GpioError> for TurretError {
    fn from(err: hardware::GpioError) -> Self {
        TurretError::Hardware(err.to_string())
    }
}

/// Result type for turret operations.
pub type Result<T> = std::result::Result<T, TurretError>;
