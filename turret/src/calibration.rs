//! Persisted tracking calibration.
//!
//! A single JSON key-value blob holding the pixel-to-step ratios, dead
//! zone, travel bounds and PID gains. Absent file means the defaults from
//! [`TrackingSettings`](crate::config::TrackingSettings) apply. Writes are
//! atomic: the blob lands in a temporary file that is renamed over the
//! target.

use std::fs;
use std::io;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::TrackingSettings;
use crate::error::{Result, TurretError};
use crate::pid::PidGains;

/// Tracking calibration blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub x_steps_per_pixel: f64,
    pub y_steps_per_pixel: f64,
    pub dead_zone_pixels: u32,
    pub x_max_steps_from_home: u32,
    pub y_max_steps_from_home: u32,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub recenter_on_loss: bool,
    /// Not part of the original blob; defaults apply when loading older
    /// files.
    #[serde(default = "default_recenter_rate")]
    pub home_recenter_rate: u32,
}

fn default_recenter_rate() -> u32 {
    5
}

impl Calibration {
    /// Build the initial calibration from configured defaults.
    pub fn from_settings(settings: &TrackingSettings) -> Self {
        Self {
            x_steps_per_pixel: settings.x_steps_per_pixel,
            y_steps_per_pixel: settings.y_steps_per_pixel,
            dead_zone_pixels: settings.dead_zone_pixels,
            x_max_steps_from_home: settings.x_max_steps_from_home,
            y_max_steps_from_home: settings.y_max_steps_from_home,
            kp: settings.pid.kp,
            ki: settings.pid.ki,
            kd: settings.pid.kd,
            recenter_on_loss: settings.recenter_on_loss,
            home_recenter_rate: settings.home_recenter_rate,
        }
    }

    pub fn gains(&self) -> PidGains {
        PidGains {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
        }
    }

    /// Load a calibration blob; `None` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(TurretError::Hardware(format!(
                    "reading calibration {}: {err}",
                    path.display()
                )))
            }
        };
        match serde_json::from_str::<Self>(&data) {
            Ok(calibration) => {
                info!("loaded calibration from {}", path.display());
                Ok(Some(calibration))
            }
            Err(err) => {
                warn!("calibration file {} unreadable: {err}", path.display());
                Err(TurretError::Malformed(format!("calibration blob: {err}")))
            }
        }
    }

    /// Atomically persist the blob (write to a sibling temp file, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| TurretError::Malformed(format!("serializing calibration: {err}")))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|err| {
            TurretError::Hardware(format!("writing {}: {err}", tmp.display()))
        })?;
        fs::rename(&tmp, path).map_err(|err| {
            TurretError::Hardware(format!("renaming calibration into place: {err}"))
        })?;
        info!("saved calibration to {}", path.display());
        Ok(())
    }
}
