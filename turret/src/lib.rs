//! Real-time motion and targeting core for a pan/tilt laser turret.
//!
//! Accepts asynchronous target signals (remote joystick frames, detector
//! bounding-box centroids and operator commands) and turns them into
//! safe, bounded, smoothly profiled stepper motion, coordinating a
//! PWM-driven laser behind strict interlocks.
//!
//! # Architecture
//!
//! ```text
//!  joystick feed ──► JoystickIngestor ─┐
//!  detector boxes ─► DetectorBridge ───┤            ┌─► TrackingController ─► StepperAxis ×2
//!  operator cmds ──► CommandHandle ────┼► arbiter ──┤        (mover task)
//!                                      │            └─► LaserSafetyController ─► PWM
//!                       TelemetryHub ◄─┘  (2 Hz snapshots)
//! ```
//!
//! A single mover task owns pulse emission for both axes; the arbiter is
//! the single consumer of the bounded command queue, promoting safety
//! commands ahead of buffered motion.
//!
//! # Tracker mode state machine
//!
//! ```text
//!             set_mode(Camera)
//!  Crosshair ───────────────────► CameraIdle ◄──────────┐
//!      ▲                           │      │             │ home complete
//!      │ home, then Crosshair      │      │ track/move  │
//!      └────── CameraHoming ◄──────┘      ▼             │
//!                    ▲             CameraTracking ──────┘
//!                    │ set_mode(Crosshair)│   ▲ enable()
//!                    └────────────────────┤   │
//!                              disable()  ▼   │
//!                                  CameraDisabled
//! ```
//!
//! # Hardware
//!
//! All device access goes through the [`hardware`] crate's
//! `GpioBackend`; tests run against its in-memory mock.

pub mod arbiter;
pub mod axis;
pub mod calibration;
pub mod cancel;
pub mod config;
pub mod detector;
pub mod error;
pub mod laser;
pub mod pid;
pub mod remote;
pub mod state;
pub mod telemetry;
pub mod tracker;

pub use arbiter::{Command, CommandHandle, CommandOutcome};
pub use axis::{AxisStatus, Direction, StepOutcome, StepTermination, StepperAxis};
pub use calibration::Calibration;
pub use cancel::CancelToken;
pub use config::TurretConfig;
pub use detector::{Detection, DetectorBridge};
pub use error::{Result, TurretError};
pub use laser::{LaserSafetyController, LaserState};
pub use pid::PidGains;
pub use remote::{JoystickIngestor, JoystickMapping, RemoteFeed, ZmqJoystickFeed};
pub use state::{ModeRequest, TrackerMode};
pub use telemetry::{TelemetryHub, TelemetrySnapshot};
pub use tracker::{AxisId, TrackingController};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hardware::GpioBackend;
use log::{info, warn};

use crate::arbiter::{ArbiterContext, CommandQueue};
use crate::telemetry::{AxisTelemetry, TELEMETRY_INTERVAL};

type DetectorSlot = Arc<Mutex<Option<Arc<DetectorBridge>>>>;

/// Fully wired turret core: axes, laser, arbiter, telemetry publisher.
///
/// Construction validates the configuration (fatal on pin collisions or
/// out-of-range values), claims every pin, and starts the mover, arbiter
/// and telemetry threads. [`Turret::shutdown`] tears all of it down and
/// is safe to call more than once.
pub struct Turret {
    gpio: Arc<dyn GpioBackend>,
    tracker: Arc<TrackingController>,
    laser: Arc<LaserSafetyController>,
    telemetry: Arc<TelemetryHub>,
    commands: CommandHandle,
    queue: Arc<CommandQueue>,
    detector: DetectorSlot,
    arbiter_thread: Mutex<Option<JoinHandle<()>>>,
    publisher_thread: Mutex<Option<JoinHandle<()>>>,
    publisher_stop: Arc<AtomicBool>,
    ingestor: Mutex<Option<JoystickIngestor>>,
    auto_fire: Arc<AtomicBool>,
    calibration_path: Option<PathBuf>,
    config: TurretConfig,
    torn_down: AtomicBool,
}

impl Turret {
    /// Build a turret with calibration defaults from the configuration.
    pub fn new(gpio: Arc<dyn GpioBackend>, config: TurretConfig) -> Result<Self> {
        let calibration = Calibration::from_settings(&config.tracking);
        Self::build(gpio, config, calibration, None)
    }

    /// Build a turret, loading the persisted calibration blob when the
    /// file exists. Subsequent [`Turret::save_calibration`] calls write
    /// back to the same path.
    pub fn with_calibration_file(
        gpio: Arc<dyn GpioBackend>,
        config: TurretConfig,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let calibration = Calibration::load(&path)?
            .unwrap_or_else(|| Calibration::from_settings(&config.tracking));
        Self::build(gpio, config, calibration, Some(path))
    }

    fn build(
        gpio: Arc<dyn GpioBackend>,
        config: TurretConfig,
        calibration: Calibration,
        calibration_path: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;

        let tracker = Arc::new(TrackingController::new(
            Arc::clone(&gpio),
            &config,
            calibration,
        )?);
        let laser = Arc::new(LaserSafetyController::new(&gpio, &config.laser)?);
        let telemetry = Arc::new(TelemetryHub::new());

        let errors = telemetry.errors();
        tracker.set_error_sink(Arc::new(move |err| {
            errors.record(err);
        }));

        let (queue, commands) = arbiter::new_queue();
        let auto_fire = Arc::new(AtomicBool::new(false));

        let ctx = ArbiterContext {
            tracker: Arc::clone(&tracker),
            laser: Arc::clone(&laser),
            errors: telemetry.errors(),
            idle_timeout: config.control.idle_timeout,
            default_pulse: config.laser.pulse,
            auto_fire: Arc::clone(&auto_fire),
        };
        let arbiter_queue = Arc::clone(&queue);
        let arbiter_thread = std::thread::Builder::new()
            .name("turret-arbiter".into())
            .spawn(move || arbiter::run(ctx, arbiter_queue))
            .map_err(|err| TurretError::Hardware(format!("spawning arbiter: {err}")))?;

        let detector: DetectorSlot = Arc::new(Mutex::new(None));
        let publisher_stop = Arc::new(AtomicBool::new(false));
        let publisher_thread = {
            let tracker = Arc::clone(&tracker);
            let laser = Arc::clone(&laser);
            let hub = Arc::clone(&telemetry);
            let detector = Arc::clone(&detector);
            let stop = Arc::clone(&publisher_stop);
            std::thread::Builder::new()
                .name("turret-telemetry".into())
                .spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        let snapshot = assemble_snapshot(&tracker, &laser, &hub, &detector);
                        hub.publish(&snapshot);
                        std::thread::sleep(TELEMETRY_INTERVAL);
                    }
                })
                .map_err(|err| TurretError::Hardware(format!("spawning telemetry: {err}")))?
        };

        info!("turret core initialized");
        Ok(Self {
            gpio,
            tracker,
            laser,
            telemetry,
            commands,
            queue,
            detector,
            arbiter_thread: Mutex::new(Some(arbiter_thread)),
            publisher_thread: Mutex::new(Some(publisher_thread)),
            publisher_stop,
            ingestor: Mutex::new(None),
            auto_fire,
            calibration_path,
            config,
            torn_down: AtomicBool::new(false),
        })
    }

    /// Producer-side handle for operator transports.
    pub fn commands(&self) -> CommandHandle {
        self.commands.clone()
    }

    pub fn tracker(&self) -> &TrackingController {
        &self.tracker
    }

    pub fn laser(&self) -> &LaserSafetyController {
        &self.laser
    }

    pub fn telemetry(&self) -> &TelemetryHub {
        &self.telemetry
    }

    pub fn config(&self) -> &TurretConfig {
        &self.config
    }

    /// Create (or return) the detector intake for a given frame geometry.
    pub fn detector_bridge(&self, frame_w: u32, frame_h: u32) -> Arc<DetectorBridge> {
        let mut slot = self.detector.lock().expect("detector slot poisoned");
        if let Some(bridge) = slot.as_ref() {
            return Arc::clone(bridge);
        }
        let bridge = Arc::new(DetectorBridge::new(self.commands(), frame_w, frame_h));
        *slot = Some(Arc::clone(&bridge));
        bridge
    }

    /// Start consuming a joystick feed. Replaces any previous feed.
    pub fn attach_joystick(&self, feed: Box<dyn RemoteFeed>) -> Result<()> {
        let mapping = JoystickMapping::from_config(&self.config.control, &self.config.laser);
        let ingestor = JoystickIngestor::spawn(feed, self.commands(), mapping)?;
        let mut slot = self.ingestor.lock().expect("ingestor slot poisoned");
        if let Some(mut previous) = slot.replace(ingestor) {
            previous.shutdown();
        }
        Ok(())
    }

    /// Fire automatically on fresh tracked targets (subject to arming and
    /// cooldown).
    pub fn set_auto_fire(&self, enable: bool) {
        self.auto_fire.store(enable, Ordering::SeqCst);
        info!("auto-fire {}", if enable { "enabled" } else { "disabled" });
    }

    /// Current read-only state, assembled on demand.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        assemble_snapshot(&self.tracker, &self.laser, &self.telemetry, &self.detector)
    }

    /// Persist the tracking calibration to the configured path.
    pub fn save_calibration(&self) -> Result<()> {
        let Some(path) = &self.calibration_path else {
            return Err(TurretError::InvalidConfig(
                "no calibration path configured".into(),
            ));
        };
        self.tracker.save_calibration(path)
    }

    /// Tear everything down: stop threads, release motors, force the
    /// laser off, free the pins. Idempotent and safe to call from signal
    /// handling paths.
    pub fn shutdown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("turret shutting down");

        if let Some(mut ingestor) = self.ingestor.lock().expect("ingestor slot poisoned").take() {
            ingestor.shutdown();
        }

        arbiter::close_queue(&self.queue);
        if let Some(handle) = self
            .arbiter_thread
            .lock()
            .expect("arbiter handle poisoned")
            .take()
        {
            if handle.join().is_err() {
                warn!("arbiter thread panicked during shutdown");
            }
        }

        self.publisher_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .publisher_thread
            .lock()
            .expect("publisher handle poisoned")
            .take()
        {
            if handle.join().is_err() {
                warn!("telemetry thread panicked during shutdown");
            }
        }

        self.tracker.shutdown();
        self.laser.shutdown();

        let mut pins = self.tracker.pins();
        pins.push(self.laser.pin());
        self.gpio.cleanup(&pins)?;
        info!("turret shutdown complete");
        Ok(())
    }
}

impl Drop for Turret {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("turret shutdown during drop failed: {err}");
        }
    }
}

fn assemble_snapshot(
    tracker: &TrackingController,
    laser: &LaserSafetyController,
    hub: &TelemetryHub,
    detector: &DetectorSlot,
) -> TelemetrySnapshot {
    let last_detection = detector
        .lock()
        .expect("detector slot poisoned")
        .as_ref()
        .and_then(|bridge| bridge.last_detection());
    TelemetrySnapshot {
        mode: tracker.mode(),
        x: AxisTelemetry::capture(tracker.x_axis()),
        y: AxisTelemetry::capture(tracker.y_axis()),
        laser: laser.status(),
        last_target_age_ms: tracker
            .last_target_age()
            .map(|age| age.as_millis().min(u64::MAX as u128) as u64),
        pid: tracker.get_pid(),
        calibration: tracker.calibration(),
        last_detection,
        last_error: hub.errors().last(),
    }
}

/// Convenience wait used by tests and embedders: true when both the mover
/// and the laser are idle.
pub fn quiesce(turret: &Turret, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    let mover_idle = turret.tracker.wait_idle(timeout);
    let remaining = deadline
        .checked_duration_since(std::time::Instant::now())
        .unwrap_or(Duration::ZERO);
    mover_idle && turret.laser.wait_idle(remaining)
}
