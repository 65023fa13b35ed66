use serde::{Deserialize, Serialize};
use std::fmt;

/// Tracking controller mode states.
///
/// `Crosshair` keeps the mechanism parked while the UI moves an on-screen
/// reticle; every camera state corresponds to live motor control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerMode {
    /// All motor motion disabled; aiming happens on the video overlay.
    Crosshair,
    /// Motors enabled, no target being followed.
    CameraIdle,
    /// A homing sequence is running.
    CameraHoming,
    /// Following detector targets or executing moves.
    CameraTracking,
    /// Motors released; commands require an explicit enable.
    CameraDisabled,
}

impl fmt::Display for TrackerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackerMode::Crosshair => "crosshair",
            TrackerMode::CameraIdle => "camera-idle",
            TrackerMode::CameraHoming => "camera-homing",
            TrackerMode::CameraTracking => "camera-tracking",
            TrackerMode::CameraDisabled => "camera-disabled",
        };
        f.write_str(name)
    }
}

impl TrackerMode {
    /// Whether this is one of the live motor-control states.
    pub fn is_camera(self) -> bool {
        !matches!(self, TrackerMode::Crosshair)
    }
}

/// Operator-facing mode selection; the controller expands this into the
/// full [`TrackerMode`] state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeRequest {
    Crosshair,
    Camera,
}
