//! Telemetry snapshots and the subscriber registry.
//!
//! Snapshots are produced at a fixed 2 Hz cadence by the owning turret and
//! fanned out to registered sinks. Axis fields are read under the axis
//! lock, so each snapshot observes a consistent view. Errors carry a
//! monotonically increasing sequence number so downstream consumers can
//! deduplicate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::axis::{AxisStatus, Direction, StepperAxis};
use crate::calibration::Calibration;
use crate::detector::Detection;
use crate::laser::LaserState;
use crate::pid::PidGains;
use crate::state::TrackerMode;

/// Snapshot publication interval.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Last error surfaced to clients, with a dedup sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub seq: u64,
    pub message: String,
}

/// Tracks the most recent error and hands out sequence numbers.
#[derive(Default)]
pub struct ErrorLog {
    seq: AtomicU64,
    last: Mutex<Option<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: impl std::fmt::Display) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last.lock().expect("error log poisoned") = Some(ErrorRecord {
            seq,
            message: message.to_string(),
        });
        seq
    }

    pub fn last(&self) -> Option<ErrorRecord> {
        self.last.lock().expect("error log poisoned").clone()
    }
}

/// Per-axis slice of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisTelemetry {
    pub position: i64,
    pub status: AxisStatus,
    pub last_direction: Option<Direction>,
    pub triggered_limit: Option<Direction>,
    pub enabled: bool,
}

impl AxisTelemetry {
    pub fn capture(axis: &StepperAxis) -> Self {
        let (position, status, last_direction) = axis.observe();
        Self {
            position,
            status,
            last_direction,
            triggered_limit: axis.triggered_limit(),
            enabled: axis.is_enabled(),
        }
    }
}

/// Read-only state broadcast to clients at 2 Hz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub mode: TrackerMode,
    pub x: AxisTelemetry,
    pub y: AxisTelemetry,
    pub laser: LaserState,
    pub last_target_age_ms: Option<u64>,
    pub pid: PidGains,
    pub calibration: Calibration,
    pub last_detection: Option<Detection>,
    pub last_error: Option<ErrorRecord>,
}

/// Callback receiving each published snapshot.
pub type SnapshotSink = Arc<dyn Fn(&TelemetrySnapshot) + Send + Sync>;

/// Sink registry keyed by subscription id.
pub struct TelemetryHub {
    sinks: Mutex<HashMap<u64, SnapshotSink>>,
    next_id: AtomicU64,
    errors: Arc<ErrorLog>,
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryHub {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            errors: Arc::new(ErrorLog::new()),
        }
    }

    pub fn errors(&self) -> Arc<ErrorLog> {
        Arc::clone(&self.errors)
    }

    /// Register a snapshot sink; returns the id used to unsubscribe.
    pub fn subscribe<F>(&self, sink: F) -> u64
    where
        F: Fn(&TelemetrySnapshot) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sinks
            .lock()
            .expect("sink registry poisoned")
            .insert(id, Arc::new(sink));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.sinks
            .lock()
            .expect("sink registry poisoned")
            .remove(&id)
            .is_some()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().expect("sink registry poisoned").len()
    }

    /// Fan a snapshot out to every registered sink.
    pub fn publish(&self, snapshot: &TelemetrySnapshot) {
        let sinks = self.sinks.lock().expect("sink registry poisoned");
        for sink in sinks.values() {
            sink(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sample_snapshot(seq_error: Option<ErrorRecord>) -> TelemetrySnapshot {
        TelemetrySnapshot {
            mode: TrackerMode::CameraIdle,
            x: AxisTelemetry {
                position: 10,
                status: AxisStatus::Idle,
                last_direction: Some(Direction::Cw),
                triggered_limit: None,
                enabled: true,
            },
            y: AxisTelemetry {
                position: -4,
                status: AxisStatus::Idle,
                last_direction: None,
                triggered_limit: None,
                enabled: true,
            },
            laser: LaserState {
                armed: false,
                power_pct: 0,
                is_on: false,
                fire_count: 0,
                cooldown_remaining_ms: 0,
                dry_run: false,
            },
            last_target_age_ms: Some(42),
            pid: PidGains {
                kp: 1.0,
                ki: 0.0,
                kd: 0.0,
            },
            calibration: Calibration::from_settings(&crate::config::TrackingSettings::default()),
            last_detection: None,
            last_error: seq_error,
        }
    }

    #[test]
    fn sinks_receive_published_snapshots() {
        let hub = TelemetryHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let id = hub.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish(&sample_snapshot(None));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(hub.unsubscribe(id));
        hub.publish(&sample_snapshot(None));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_log_sequence_increases() {
        let log = ErrorLog::new();
        assert!(log.last().is_none());
        let first = log.record("limit blocked");
        let second = log.record("cooldown");
        assert!(second > first);
        assert_eq!(log.last().unwrap().message, "cooldown");
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let snapshot = sample_snapshot(Some(ErrorRecord {
            seq: 7,
            message: "laser cooling down".into(),
        }));
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"seq\":7"));
        assert!(json.contains("\"position\":10"));
    }
}
