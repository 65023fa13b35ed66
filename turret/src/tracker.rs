//! Tracking controller: pixel-to-step conversion, dual-axis PID
//! compensation, mode arbitration and the single mover task.
//!
//! All pulse emission is serialized through one mover thread. Detector
//! samples coalesce: the newest pending sample replaces an older pending
//! one, so the mover always acts on the latest observation. Discrete
//! moves queue in arrival order. Blocking operations (homing)
//! take the same motion lock the mover dispatch does, keeping at most one
//! axis-pair movement in flight.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hardware::GpioBackend;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::axis::{AxisConfig, Direction, StepperAxis};
use crate::calibration::Calibration;
use crate::cancel::CancelToken;
use crate::config::TurretConfig;
use crate::error::{Result, TurretError};
use crate::pid::{PidAxis, PidGains};
use crate::state::{ModeRequest, TrackerMode};

/// Mover wake-up granularity for loss-of-target detection and
/// recentering ticks.
const MOVER_TICK: Duration = Duration::from_millis(20);

/// Pan/tilt axis selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisId {
    X,
    Y,
}

#[derive(Debug, Clone, Copy)]
struct TrackSample {
    cx: f64,
    cy: f64,
    frame_w: u32,
    frame_h: u32,
    ts: Instant,
}

#[derive(Debug, Clone, Copy)]
enum MoveKind {
    Relative { dx: i64, dy: i64 },
    Absolute { x: i64, y: i64 },
}

enum Work {
    Track(TrackSample),
    Move(MoveKind),
    Recenter,
}

struct MoverInbox {
    pending_track: Option<TrackSample>,
    moves: VecDeque<MoveKind>,
    busy: bool,
    shutdown: bool,
}

impl MoverInbox {
    fn is_idle(&self) -> bool {
        !self.busy && self.pending_track.is_none() && self.moves.is_empty()
    }
}

struct PidPair {
    gains: PidGains,
    x: PidAxis,
    y: PidAxis,
}

/// Callback used to surface mover-side failures to telemetry.
pub type ErrorSink = Arc<dyn Fn(&TurretError) + Send + Sync>;

struct TrackerInner {
    x: StepperAxis,
    y: StepperAxis,
    calibration: RwLock<Calibration>,
    mode: Mutex<TrackerMode>,
    pid: Mutex<PidPair>,
    inbox: Mutex<MoverInbox>,
    inbox_cv: Condvar,
    idle_cv: Condvar,
    last_target: Mutex<Option<Instant>>,
    loss_timeout: Duration,
    step_delay_s: f64,
    cancel: CancelToken,
    /// Serializes mover dispatch against blocking operations like homing.
    motion: Mutex<()>,
    error_sink: Mutex<Option<ErrorSink>>,
}

/// Owns the axis pair, calibration and PID state; all motion funnels
/// through its mover thread.
pub struct TrackingController {
    inner: Arc<TrackerInner>,
    mover: Mutex<Option<JoinHandle<()>>>,
    torn_down: std::sync::atomic::AtomicBool,
}

impl TrackingController {
    pub fn new(
        gpio: Arc<dyn GpioBackend>,
        config: &TurretConfig,
        calibration: Calibration,
    ) -> Result<Self> {
        let x = StepperAxis::new(
            Arc::clone(&gpio),
            AxisConfig {
                name: "x",
                step_pin: config.motor.x.step,
                dir_pin: config.motor.x.dir,
                enable_pin: config.motor.x.enable,
                cw_limit_pin: config.pins.x_cw_limit,
                ccw_limit_pin: config.pins.x_ccw_limit,
                microstep_pins: config.motor.microstep_pins,
                steps_per_rev: config.motor.steps_per_rev,
                microsteps: config.motor.microsteps,
                step_delay_s: config.control.step_delay_s,
                acceleration_steps: config.control.acceleration_steps,
                backoff_steps: config.motor.backoff_steps,
                home_timeout: config.control.home_timeout,
            },
        )?;
        let y = StepperAxis::new(
            Arc::clone(&gpio),
            AxisConfig {
                name: "y",
                step_pin: config.motor.y.step,
                dir_pin: config.motor.y.dir,
                enable_pin: config.motor.y.enable,
                cw_limit_pin: config.pins.y_cw_limit,
                ccw_limit_pin: config.pins.y_ccw_limit,
                microstep_pins: config.motor.microstep_pins,
                steps_per_rev: config.motor.steps_per_rev,
                microsteps: config.motor.microsteps,
                step_delay_s: config.control.step_delay_s,
                acceleration_steps: config.control.acceleration_steps,
                backoff_steps: config.motor.backoff_steps,
                home_timeout: config.control.home_timeout,
            },
        )?;

        let gains = calibration.gains();
        gains.validate()?;

        let inner = Arc::new(TrackerInner {
            x,
            y,
            calibration: RwLock::new(calibration),
            mode: Mutex::new(TrackerMode::Crosshair),
            pid: Mutex::new(PidPair {
                gains,
                x: PidAxis::new(),
                y: PidAxis::new(),
            }),
            inbox: Mutex::new(MoverInbox {
                pending_track: None,
                moves: VecDeque::new(),
                busy: false,
                shutdown: false,
            }),
            inbox_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            last_target: Mutex::new(None),
            loss_timeout: config.tracking.loss_timeout,
            step_delay_s: config.control.step_delay_s,
            cancel: CancelToken::new(),
            motion: Mutex::new(()),
            error_sink: Mutex::new(None),
        });

        let mover_inner = Arc::clone(&inner);
        let mover = thread::Builder::new()
            .name("turret-mover".into())
            .spawn(move || mover_loop(mover_inner))
            .map_err(|err| TurretError::Hardware(format!("spawning mover: {err}")))?;

        Ok(Self {
            inner,
            mover: Mutex::new(Some(mover)),
            torn_down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Install the callback that receives mover-side errors.
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.inner.error_sink.lock().expect("error sink poisoned") = Some(sink);
    }

    pub fn mode(&self) -> TrackerMode {
        *self.inner.mode.lock().expect("mode poisoned")
    }

    pub fn x_axis(&self) -> &StepperAxis {
        &self.inner.x
    }

    pub fn y_axis(&self) -> &StepperAxis {
        &self.inner.y
    }

    pub fn calibration(&self) -> Calibration {
        self.inner
            .calibration
            .read()
            .expect("calibration poisoned")
            .clone()
    }

    /// Switch between crosshair aiming and live camera tracking.
    ///
    /// Leaving a camera state homes the mechanism first, so the reticle
    /// overlay starts from a known pose.
    pub fn set_mode(&self, request: ModeRequest) -> Result<()> {
        match request {
            ModeRequest::Camera => {
                let mut mode = self.inner.mode.lock().expect("mode poisoned");
                if *mode == TrackerMode::Crosshair {
                    *mode = TrackerMode::CameraIdle;
                    info!("tracker mode -> camera");
                    self.reset_pid();
                }
                Ok(())
            }
            ModeRequest::Crosshair => {
                let was_camera = {
                    let mut mode = self.inner.mode.lock().expect("mode poisoned");
                    let was_camera = mode.is_camera();
                    if was_camera {
                        *mode = TrackerMode::CameraHoming;
                    }
                    was_camera
                };
                let home_result = if was_camera { self.home_axes() } else { Ok(()) };
                *self.inner.mode.lock().expect("mode poisoned") = TrackerMode::Crosshair;
                self.reset_pid();
                info!("tracker mode -> crosshair");
                home_result
            }
        }
    }

    /// Assert both enable lines; leaves `CameraDisabled`.
    pub fn enable(&self) -> Result<()> {
        self.inner.x.enable()?;
        self.inner.y.enable()?;
        let mut mode = self.inner.mode.lock().expect("mode poisoned");
        if *mode == TrackerMode::CameraDisabled {
            *mode = TrackerMode::CameraIdle;
        }
        Ok(())
    }

    /// Release both motors.
    pub fn disable(&self) -> Result<()> {
        self.inner.x.release()?;
        self.inner.y.release()?;
        let mut mode = self.inner.mode.lock().expect("mode poisoned");
        if mode.is_camera() {
            *mode = TrackerMode::CameraDisabled;
        }
        drop(mode);
        self.reset_pid();
        Ok(())
    }

    /// Home both axes sequentially; blocks until done or failed.
    pub fn home(&self) -> Result<()> {
        {
            let mut mode = self.inner.mode.lock().expect("mode poisoned");
            match *mode {
                TrackerMode::Crosshair | TrackerMode::CameraDisabled => {
                    return Err(TurretError::ModeDisabled(*mode))
                }
                _ => *mode = TrackerMode::CameraHoming,
            }
        }
        let result = self.home_axes();
        let mut mode = self.inner.mode.lock().expect("mode poisoned");
        if *mode == TrackerMode::CameraHoming {
            *mode = TrackerMode::CameraIdle;
        }
        result
    }

    fn home_axes(&self) -> Result<()> {
        self.reset_pid();
        let _motion = self.inner.motion.lock().expect("motion lock poisoned");
        self.inner.x.home(&self.inner.cancel)?;
        self.inner.y.home(&self.inner.cancel)?;
        Ok(())
    }

    /// Zero both axes at the current pose without moving.
    pub fn set_home_here(&self) {
        self.inner.x.set_home_here();
        self.inner.y.set_home_here();
    }

    fn gate_motion(&self) -> Result<()> {
        let mut mode = self.inner.mode.lock().expect("mode poisoned");
        match *mode {
            TrackerMode::Crosshair | TrackerMode::CameraDisabled | TrackerMode::CameraHoming => {
                Err(TurretError::ModeDisabled(*mode))
            }
            TrackerMode::CameraIdle => {
                *mode = TrackerMode::CameraTracking;
                Ok(())
            }
            TrackerMode::CameraTracking => Ok(()),
        }
    }

    /// Queue a relative move, clamped against the travel bounds at
    /// execution time.
    pub fn move_by(&self, dx: i64, dy: i64) -> Result<()> {
        self.gate_motion()?;
        self.enqueue_move(MoveKind::Relative { dx, dy })
    }

    /// Queue a move to an absolute position relative to home.
    pub fn move_absolute(&self, x: i64, y: i64) -> Result<()> {
        self.gate_motion()?;
        self.enqueue_move(MoveKind::Absolute { x, y })
    }

    /// Convert a pixel position into a step move and queue it.
    ///
    /// Offsets inside the dead zone produce zero motion on that axis.
    /// Returns the queued `(dx, dy)` step deltas.
    pub fn center_on_pixel(&self, px: f64, py: f64, frame_w: u32, frame_h: u32) -> Result<(i64, i64)> {
        self.gate_motion()?;
        let cal = self.calibration();
        let dead_zone = cal.dead_zone_pixels as f64;
        let offset_x = px - frame_w as f64 / 2.0;
        let offset_y = py - frame_h as f64 / 2.0;
        let dx = if offset_x.abs() <= dead_zone {
            0
        } else {
            (offset_x * cal.x_steps_per_pixel).round() as i64
        };
        let dy = if offset_y.abs() <= dead_zone {
            0
        } else {
            (offset_y * cal.y_steps_per_pixel).round() as i64
        };
        if dx != 0 || dy != 0 {
            self.enqueue_move(MoveKind::Relative { dx, dy })?;
        }
        Ok((dx, dy))
    }

    /// Feed a detector centroid into the PID pipeline.
    ///
    /// The sample is coalesced into the mover inbox; if an older sample is
    /// still pending it is replaced by this one.
    pub fn track_target(&self, cx: f64, cy: f64, frame_w: u32, frame_h: u32, ts: Instant) -> Result<()> {
        self.gate_motion()?;
        *self.inner.last_target.lock().expect("last target poisoned") = Some(Instant::now());

        let mut inbox = self.inner.inbox.lock().expect("inbox poisoned");
        inbox.pending_track = Some(TrackSample {
            cx,
            cy,
            frame_w,
            frame_h,
            ts,
        });
        drop(inbox);
        self.inner.inbox_cv.notify_one();
        Ok(())
    }

    fn enqueue_move(&self, kind: MoveKind) -> Result<()> {
        let mut inbox = self.inner.inbox.lock().expect("inbox poisoned");
        if inbox.shutdown {
            return Err(TurretError::Cancelled);
        }
        inbox.moves.push_back(kind);
        drop(inbox);
        self.inner.inbox_cv.notify_one();
        Ok(())
    }

    /// Update steps-per-pixel from an observed move.
    pub fn calibrate_axis(&self, axis: AxisId, pixels_moved: f64, steps_executed: i64) -> Result<f64> {
        if pixels_moved == 0.0 || !pixels_moved.is_finite() {
            return Err(TurretError::Malformed(
                "calibration requires nonzero pixel movement".into(),
            ));
        }
        let ratio = (steps_executed as f64 / pixels_moved).abs();
        let mut cal = self.inner.calibration.write().expect("calibration poisoned");
        match axis {
            AxisId::X => cal.x_steps_per_pixel = ratio,
            AxisId::Y => cal.y_steps_per_pixel = ratio,
        }
        info!("{axis:?} axis calibrated: {ratio:.4} steps/pixel");
        Ok(ratio)
    }

    /// Replace the PID gains (shared across both axes).
    pub fn set_pid(&self, gains: PidGains) -> Result<()> {
        gains.validate()?;
        {
            let mut pid = self.inner.pid.lock().expect("pid poisoned");
            pid.gains = gains;
        }
        let mut cal = self.inner.calibration.write().expect("calibration poisoned");
        cal.kp = gains.kp;
        cal.ki = gains.ki;
        cal.kd = gains.kd;
        Ok(())
    }

    pub fn get_pid(&self) -> PidGains {
        self.inner.pid.lock().expect("pid poisoned").gains
    }

    /// Current integral terms, mainly for telemetry and tests.
    pub fn pid_integrals(&self) -> (f64, f64) {
        let pid = self.inner.pid.lock().expect("pid poisoned");
        (pid.x.integral(), pid.y.integral())
    }

    /// Time since the last successful `track_target` call.
    pub fn last_target_age(&self) -> Option<Duration> {
        self.inner
            .last_target
            .lock()
            .expect("last target poisoned")
            .map(|t| t.elapsed())
    }

    /// Update the stored dead zone / bounds portion of the calibration.
    pub fn update_calibration(&self, update: impl FnOnce(&mut Calibration)) {
        let mut cal = self.inner.calibration.write().expect("calibration poisoned");
        update(&mut cal);
    }

    /// Persist the current calibration blob.
    pub fn save_calibration(&self, path: &std::path::Path) -> Result<()> {
        let cal = self.calibration();
        cal.save(path)
    }

    fn reset_pid(&self) {
        let mut pid = self.inner.pid.lock().expect("pid poisoned");
        pid.x.reset();
        pid.y.reset();
    }

    /// Block until the mover has drained its inbox.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let inbox = self.inner.inbox.lock().expect("inbox poisoned");
        let (inbox, result) = self
            .inner
            .idle_cv
            .wait_timeout_while(inbox, timeout, |i| !i.is_idle())
            .expect("inbox poisoned");
        drop(inbox);
        !result.timed_out()
    }

    /// Stop the mover, release the motors. Idempotent.
    pub fn shutdown(&self) {
        if self.torn_down.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        {
            let mut inbox = self.inner.inbox.lock().expect("inbox poisoned");
            inbox.shutdown = true;
            inbox.pending_track = None;
            inbox.moves.clear();
        }
        self.inner.inbox_cv.notify_all();
        if let Some(handle) = self.mover.lock().expect("mover handle poisoned").take() {
            if handle.join().is_err() {
                error!("mover thread panicked during shutdown");
            }
        }
        if let Err(err) = self.inner.x.release() {
            warn!("x axis not released during shutdown: {err}");
        }
        if let Err(err) = self.inner.y.release() {
            warn!("y axis not released during shutdown: {err}");
        }
    }

    /// Pins owned by the axis pair, for teardown.
    pub fn pins(&self) -> Vec<hardware::Pin> {
        let mut pins = self.inner.x.pins();
        pins.extend(self.inner.y.pins());
        pins
    }
}

impl Drop for TrackingController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn mover_loop(inner: Arc<TrackerInner>) {
    debug!("mover task started");
    loop {
        let work = {
            let mut inbox = inner.inbox.lock().expect("inbox poisoned");
            loop {
                if inbox.shutdown {
                    debug!("mover task stopping");
                    return;
                }
                if let Some(sample) = inbox.pending_track.take() {
                    inbox.busy = true;
                    break Work::Track(sample);
                }
                if let Some(kind) = inbox.moves.pop_front() {
                    inbox.busy = true;
                    break Work::Move(kind);
                }

                let (returned, timeout) = inner
                    .inbox_cv
                    .wait_timeout(inbox, MOVER_TICK)
                    .expect("inbox poisoned");
                inbox = returned;
                if timeout.timed_out() && target_is_stale(&inner) {
                    // Loss of target: PID state never survives a dropout.
                    {
                        let mut pid = inner.pid.lock().expect("pid poisoned");
                        pid.x.reset();
                        pid.y.reset();
                    }
                    if recenter_due(&inner) {
                        inbox.busy = true;
                        break Work::Recenter;
                    }
                }
            }
        };

        let result = match work {
            Work::Track(sample) => run_track(&inner, sample),
            Work::Move(kind) => run_move(&inner, kind),
            Work::Recenter => run_recenter_tick(&inner),
        };
        if let Err(err) = result {
            error!("mover: {err}");
            if let Some(sink) = inner.error_sink.lock().expect("error sink poisoned").as_ref() {
                sink(&err);
            }
        }

        let mut inbox = inner.inbox.lock().expect("inbox poisoned");
        inbox.busy = false;
        if inbox.is_idle() {
            inner.idle_cv.notify_all();
        }
    }
}

fn target_is_stale(inner: &TrackerInner) -> bool {
    let last = inner.last_target.lock().expect("last target poisoned");
    match *last {
        Some(t) => t.elapsed() >= inner.loss_timeout,
        None => false,
    }
}

fn recenter_due(inner: &TrackerInner) -> bool {
    if *inner.mode.lock().expect("mode poisoned") != TrackerMode::CameraTracking {
        return false;
    }
    if !inner
        .calibration
        .read()
        .expect("calibration poisoned")
        .recenter_on_loss
    {
        return false;
    }
    inner.x.position() != 0 || inner.y.position() != 0
}

/// PID update on the latest sample, then a bounded move.
fn run_track(inner: &TrackerInner, sample: TrackSample) -> Result<()> {
    let cal = inner
        .calibration
        .read()
        .expect("calibration poisoned")
        .clone();
    let dead_zone = cal.dead_zone_pixels as f64;
    let error_x = sample.cx - sample.frame_w as f64 / 2.0;
    let error_y = sample.cy - sample.frame_h as f64 / 2.0;

    let (out_x, out_y) = {
        let mut pid = inner.pid.lock().expect("pid poisoned");
        let gains = pid.gains;
        let out_x = if error_x.abs() <= dead_zone {
            pid.x.reset();
            0.0
        } else {
            let limit = gains.integral_limit(cal.x_max_steps_from_home);
            pid.x.update(error_x, sample.ts, &gains, limit)
        };
        let out_y = if error_y.abs() <= dead_zone {
            pid.y.reset();
            0.0
        } else {
            let limit = gains.integral_limit(cal.y_max_steps_from_home);
            pid.y.update(error_y, sample.ts, &gains, limit)
        };
        (out_x, out_y)
    };

    let dx = (out_x * cal.x_steps_per_pixel).round() as i64;
    let dy = (out_y * cal.y_steps_per_pixel).round() as i64;
    if dx == 0 && dy == 0 {
        return Ok(());
    }
    execute_move(inner, MoveKind::Relative { dx, dy }, &cal)
}

fn run_move(inner: &TrackerInner, kind: MoveKind) -> Result<()> {
    let cal = inner
        .calibration
        .read()
        .expect("calibration poisoned")
        .clone();
    execute_move(inner, kind, &cal)
}

/// One recentering tick: a small step toward home on each displaced axis.
fn run_recenter_tick(inner: &TrackerInner) -> Result<()> {
    let cal = inner
        .calibration
        .read()
        .expect("calibration poisoned")
        .clone();
    let rate = cal.home_recenter_rate as i64;

    let mut dx = 0;
    let pos_x = inner.x.position();
    if pos_x != 0 {
        dx = -pos_x.signum() * rate.min(pos_x.abs());
    }
    let mut dy = 0;
    let pos_y = inner.y.position();
    if pos_y != 0 {
        dy = -pos_y.signum() * rate.min(pos_y.abs());
    }
    if dx == 0 && dy == 0 {
        return Ok(());
    }
    debug!("recentering: ({dx}, {dy}) toward home");
    execute_move(inner, MoveKind::Relative { dx, dy }, &cal)?;

    if inner.x.position() == 0 && inner.y.position() == 0 {
        let mut mode = inner.mode.lock().expect("mode poisoned");
        if *mode == TrackerMode::CameraTracking {
            *mode = TrackerMode::CameraIdle;
            info!("recentered after target loss");
        }
    }
    Ok(())
}

/// Clamp against the travel bounds and emit steps, one axis at a time.
fn execute_move(inner: &TrackerInner, kind: MoveKind, cal: &Calibration) -> Result<()> {
    let _motion = inner.motion.lock().expect("motion lock poisoned");

    let bounds_x = cal.x_max_steps_from_home as i64;
    let bounds_y = cal.y_max_steps_from_home as i64;
    let (target_x, target_y) = match kind {
        MoveKind::Relative { dx, dy } => (
            (inner.x.position() + dx).clamp(-bounds_x, bounds_x),
            (inner.y.position() + dy).clamp(-bounds_y, bounds_y),
        ),
        MoveKind::Absolute { x, y } => {
            (x.clamp(-bounds_x, bounds_x), y.clamp(-bounds_y, bounds_y))
        }
    };

    for (axis, target) in [(&inner.x, target_x), (&inner.y, target_y)] {
        let delta = target - axis.position();
        if delta == 0 {
            continue;
        }
        let (direction, count) = if delta > 0 {
            (Direction::Cw, delta as u32)
        } else {
            (Direction::Ccw, (-delta) as u32)
        };
        let outcome = axis.step(direction, count, inner.step_delay_s, &inner.cancel)?;
        if outcome.steps_emitted != count {
            debug!(
                "axis move cut short at {} of {count} steps ({:?})",
                outcome.steps_emitted, outcome.terminated_by
            );
        }
    }
    Ok(())
}
