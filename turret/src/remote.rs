//! Remote joystick input.
//!
//! The transmitter publishes ASCII frames `"x,y,joy_btn,laser_btn,power"`
//! on a pub/sub bus. This module validates and maps them: deadzone and
//! speed scaling turn stick deflection into bounded jogs, and a rising
//! edge on the laser button fires the configured default pulse at the
//! sample's power setting. Malformed frames are dropped with a warning;
//! the idle watchdog keeps running regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::arbiter::{Command, CommandHandle};
use crate::axis::Direction;
use crate::config::{ControlSettings, LaserSettings};
use crate::error::{Result, TurretError};
use crate::tracker::AxisId;

/// Poll interval for feed reads, so the ingestor notices shutdown.
const FEED_POLL: Duration = Duration::from_millis(100);

/// One parsed joystick frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoystickSample {
    pub x: f64,
    pub y: f64,
    pub joy_btn: bool,
    pub laser_btn: bool,
    pub power: f64,
}

/// Parse and validate a joystick wire frame.
pub fn parse_joystick(line: &str) -> Result<JoystickSample> {
    let trimmed = line.trim();
    let parts: Vec<&str> = trimmed.split(',').collect();
    if parts.len() != 5 {
        return Err(TurretError::Malformed(format!(
            "expected 5 fields, got {} in {trimmed:?}",
            parts.len()
        )));
    }

    let axis = |field: &str, name: &str| -> Result<f64> {
        let value: f64 = field
            .trim()
            .parse()
            .map_err(|_| TurretError::Malformed(format!("{name} is not a number: {field:?}")))?;
        if !(-100.0..=100.0).contains(&value) {
            return Err(TurretError::Malformed(format!(
                "{name} out of range [-100, 100]: {value}"
            )));
        }
        Ok(value)
    };
    let boolean = |field: &str, name: &str| -> Result<bool> {
        match field.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(TurretError::Malformed(format!(
                "{name} is not a boolean: {other:?}"
            ))),
        }
    };

    let x = axis(parts[0], "x")?;
    let y = axis(parts[1], "y")?;
    let joy_btn = boolean(parts[2], "joystick button")?;
    let laser_btn = boolean(parts[3], "laser button")?;
    let power: f64 = parts[4]
        .trim()
        .parse()
        .map_err(|_| TurretError::Malformed(format!("power is not a number: {:?}", parts[4])))?;
    if !(0.0..=100.0).contains(&power) {
        return Err(TurretError::Malformed(format!(
            "power out of range [0, 100]: {power}"
        )));
    }

    Ok(JoystickSample {
        x,
        y,
        joy_btn,
        laser_btn,
        power,
    })
}

/// Map a stick deflection to signed steps.
///
/// Deflection inside the deadzone is zero; the remainder is normalized
/// over the span above the deadzone, scaled, and bounded by
/// `max_steps_per_update`.
pub fn map_axis_steps(value: f64, deadzone: f64, speed_scaling: f64, max_steps: u32) -> i64 {
    let magnitude = value.abs();
    if magnitude < deadzone {
        return 0;
    }
    let span = 100.0 - deadzone;
    if span <= 0.0 {
        return 0;
    }
    let effective = (magnitude - deadzone).clamp(0.0, span);
    let steps = (effective / span * speed_scaling * max_steps as f64).round() as i64;
    if value < 0.0 {
        -steps
    } else {
        steps
    }
}

/// Source of raw joystick frames.
pub trait RemoteFeed: Send {
    /// Next frame, or `None` if nothing arrived within `timeout`.
    fn next(&mut self, timeout: Duration) -> Option<String>;
}

/// Channel-backed feed, used by tests and by embedders that already have
/// their own bus client.
pub struct ChannelFeed {
    receiver: Receiver<String>,
}

impl ChannelFeed {
    pub fn new(receiver: Receiver<String>) -> Self {
        Self { receiver }
    }
}

impl RemoteFeed for ChannelFeed {
    fn next(&mut self, timeout: Duration) -> Option<String> {
        match self.receiver.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// ZeroMQ SUB feed for the transmitter's pub socket.
pub struct ZmqJoystickFeed {
    socket: zmq::Socket,
}

impl ZmqJoystickFeed {
    /// Connect and subscribe to every frame on the endpoint.
    pub fn connect(endpoint: &str) -> Result<Self> {
        let context = zmq::Context::new();
        let socket = context
            .socket(zmq::SUB)
            .map_err(|err| TurretError::Hardware(format!("zmq socket: {err}")))?;
        socket
            .connect(endpoint)
            .map_err(|err| TurretError::Hardware(format!("zmq connect {endpoint}: {err}")))?;
        socket
            .set_subscribe(b"")
            .map_err(|err| TurretError::Hardware(format!("zmq subscribe: {err}")))?;
        Ok(Self { socket })
    }
}

impl RemoteFeed for ZmqJoystickFeed {
    fn next(&mut self, timeout: Duration) -> Option<String> {
        if self
            .socket
            .set_rcvtimeo(timeout.as_millis().min(i32::MAX as u128) as i32)
            .is_err()
        {
            return None;
        }
        match self.socket.recv_string(0) {
            Ok(Ok(line)) => Some(line),
            Ok(Err(_)) => {
                warn!("dropping non-UTF8 joystick frame");
                None
            }
            Err(_) => None,
        }
    }
}

/// Mapping parameters for the ingestor, taken from the control and laser
/// configuration.
#[derive(Debug, Clone)]
pub struct JoystickMapping {
    pub deadzone: f64,
    pub speed_scaling: f64,
    pub max_steps_per_update: u32,
    pub default_pulse: Duration,
}

impl JoystickMapping {
    pub fn from_config(control: &ControlSettings, laser: &LaserSettings) -> Self {
        Self {
            deadzone: control.deadzone,
            speed_scaling: control.speed_scaling,
            max_steps_per_update: control.max_steps_per_update,
            default_pulse: laser.pulse,
        }
    }
}

/// Background thread consuming a [`RemoteFeed`] into the command queue.
pub struct JoystickIngestor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl JoystickIngestor {
    pub fn spawn(
        mut feed: Box<dyn RemoteFeed>,
        commands: CommandHandle,
        mapping: JoystickMapping,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("joystick-ingestor".into())
            .spawn(move || {
                let mut laser_btn_was_down = false;
                while !stop_flag.load(Ordering::SeqCst) {
                    let Some(line) = feed.next(FEED_POLL) else {
                        continue;
                    };
                    match parse_joystick(&line) {
                        Err(err) => warn!("dropping joystick frame: {err}"),
                        Ok(sample) => {
                            ingest_sample(&commands, &mapping, sample, &mut laser_btn_was_down)
                        }
                    }
                }
                debug!("joystick ingestor stopped");
            })
            .map_err(|err| TurretError::Hardware(format!("spawning ingestor: {err}")))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the ingestor thread and wait for it.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("joystick ingestor panicked");
            }
        }
    }
}

impl Drop for JoystickIngestor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ingest_sample(
    commands: &CommandHandle,
    mapping: &JoystickMapping,
    sample: JoystickSample,
    laser_btn_was_down: &mut bool,
) {
    for (axis, value) in [(AxisId::X, sample.x), (AxisId::Y, sample.y)] {
        let steps = map_axis_steps(
            value,
            mapping.deadzone,
            mapping.speed_scaling,
            mapping.max_steps_per_update,
        );
        if steps == 0 {
            continue;
        }
        let direction = if steps > 0 {
            Direction::Cw
        } else {
            Direction::Ccw
        };
        commands.submit_remote(Command::Jog {
            axis,
            steps: steps.unsigned_abs() as u32,
            direction,
        });
    }

    if sample.laser_btn && !*laser_btn_was_down {
        commands.submit_remote(Command::LaserSetPower(sample.power.round() as u8));
        commands.submit_remote(Command::LaserFire {
            duration_ms: mapping.default_pulse.as_millis() as u64,
        });
    }
    *laser_btn_was_down = sample.laser_btn;

    if sample.joy_btn {
        debug!("joystick button pressed");
    }
}
