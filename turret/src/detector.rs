//! Detector intake: bounding boxes in, tracking commands out.
//!
//! The video pipeline (outside this crate) calls [`DetectorBridge::on_detection`]
//! with whatever its backend produced. Only the largest box per frame
//! steers the turret; the full detection is echoed into telemetry.

use std::sync::Mutex;
use std::time::Instant;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::arbiter::{Command, CommandHandle};

/// One detection from an external backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Backend-specific class label ("face", "balloon", ...).
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub confidence: f32,
}

impl Detection {
    pub fn area(&self) -> f64 {
        self.w * self.h
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }
}

/// Most recent target position handed to the tracker.
#[derive(Debug, Clone, Copy)]
pub struct RecentTarget {
    pub cx: f64,
    pub cy: f64,
    pub ts: Instant,
}

/// Adapter between detector callbacks and the command pipeline.
pub struct DetectorBridge {
    commands: CommandHandle,
    frame_w: u32,
    frame_h: u32,
    recent: Mutex<Option<RecentTarget>>,
    last_detection: Mutex<Option<Detection>>,
}

impl DetectorBridge {
    pub fn new(commands: CommandHandle, frame_w: u32, frame_h: u32) -> Self {
        Self {
            commands,
            frame_w,
            frame_h,
            recent: Mutex::new(None),
            last_detection: Mutex::new(None),
        }
    }

    /// Detector callback entry point. Non-blocking apart from the bounded
    /// command-queue send.
    pub fn on_detection(&self, detections: &[Detection]) {
        let Some(best) = detections.iter().max_by(|a, b| {
            a.area()
                .partial_cmp(&b.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            return;
        };

        let (cx, cy) = best.center();
        let ts = Instant::now();
        *self.recent.lock().expect("recent target poisoned") = Some(RecentTarget { cx, cy, ts });
        *self
            .last_detection
            .lock()
            .expect("last detection poisoned") = Some(best.clone());

        debug!(
            "detector target {} at ({cx:.1}, {cy:.1}), {} candidate(s)",
            best.kind,
            detections.len()
        );
        self.commands.submit_remote(Command::TrackTarget {
            cx,
            cy,
            frame_w: self.frame_w,
            frame_h: self.frame_h,
            ts,
        });
    }

    /// Latest centroid forwarded to the tracker, if any.
    pub fn recent_target(&self) -> Option<RecentTarget> {
        *self.recent.lock().expect("recent target poisoned")
    }

    /// Latest raw detection, for telemetry passthrough.
    pub fn last_detection(&self) -> Option<Detection> {
        self.last_detection
            .lock()
            .expect("last detection poisoned")
            .clone()
    }
}
