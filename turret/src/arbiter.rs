//! Single-writer command pipeline.
//!
//! Every producer (the remote joystick ingestor, detector callbacks and
//! operator transports) lands on one bounded queue of capacity 64. A
//! single consumer thread dispatches to the tracking and laser
//! controllers. Safety commands (`Disable`, `LaserArm(false)`) jump ahead
//! of buffered work; everything else keeps arrival order. Producers block
//! on a condvar when the queue is full rather than spinning.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::axis::Direction;
use crate::error::TurretError;
use crate::laser::LaserSafetyController;
use crate::state::ModeRequest;
use crate::telemetry::ErrorLog;
use crate::tracker::{AxisId, TrackingController};

/// Bounded depth of the command channel.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// How long an operator submission waits for its outcome.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands accepted by the arbiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Bounded manual step request on one axis.
    Jog {
        axis: AxisId,
        steps: u32,
        direction: Direction,
    },
    /// Move to an absolute position relative to home.
    MoveAbsolute { x_steps: i64, y_steps: i64 },
    /// Center the view on a clicked pixel.
    CenterOnPixel {
        x: f64,
        y: f64,
        frame_w: u32,
        frame_h: u32,
    },
    /// Detector-sourced centroid, subject to PID and dead zone.
    TrackTarget {
        cx: f64,
        cy: f64,
        frame_w: u32,
        frame_h: u32,
        ts: Instant,
    },
    SetMode(ModeRequest),
    Home,
    SetHome,
    Disable,
    Enable,
    LaserArm(bool),
    LaserSetPower(u8),
    LaserFire { duration_ms: u64 },
    LaserBurst { count: u32, on_ms: u64, off_ms: u64 },
}

impl Command {
    /// Safety commands preempt buffered motion commands.
    fn is_safety(&self) -> bool {
        matches!(self, Command::Disable | Command::LaserArm(false))
    }

    /// Whether processing this command should reassert the enable lines
    /// after an idle-watchdog release.
    fn reasserts_enable(&self) -> bool {
        !matches!(self, Command::Disable | Command::LaserArm(false))
    }
}

/// Operator-visible result of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Ok,
    Rejected(String),
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Ok)
    }
}

pub(crate) struct Envelope {
    pub command: Command,
    pub reply: Option<SyncSender<CommandOutcome>>,
    /// Set for joystick/detector traffic; feeds the idle watchdog.
    pub from_remote: bool,
}

enum Popped {
    Entry(Envelope),
    TimedOut,
    Closed,
}

struct QueueState {
    entries: VecDeque<Envelope>,
    closed: bool,
}

/// Bounded multi-producer queue with safety promotion.
pub(crate) struct CommandQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl CommandQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocking push; returns `false` once the queue is closed.
    fn push(&self, envelope: Envelope) -> bool {
        let mut state = self.state.lock().expect("command queue poisoned");
        while state.entries.len() >= COMMAND_QUEUE_CAPACITY && !state.closed {
            state = self
                .not_full
                .wait(state)
                .expect("command queue poisoned");
        }
        if state.closed {
            return false;
        }
        if envelope.command.is_safety() {
            state.entries.push_front(envelope);
        } else {
            state.entries.push_back(envelope);
        }
        drop(state);
        self.not_empty.notify_one();
        true
    }

    fn pop(&self, timeout: Duration) -> Popped {
        let mut state = self.state.lock().expect("command queue poisoned");
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(envelope) = state.entries.pop_front() {
                self.not_full.notify_one();
                return Popped::Entry(envelope);
            }
            if state.closed {
                return Popped::Closed;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Popped::TimedOut;
            };
            let (returned, result) = self
                .not_empty
                .wait_timeout(state, remaining)
                .expect("command queue poisoned");
            state = returned;
            if result.timed_out() && state.entries.is_empty() {
                return Popped::TimedOut;
            }
        }
    }

    fn close(&self) {
        self.state.lock().expect("command queue poisoned").closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn len(&self) -> usize {
        self.state.lock().expect("command queue poisoned").entries.len()
    }
}

/// Cloneable producer-side handle onto the command pipeline.
#[derive(Clone)]
pub struct CommandHandle {
    queue: Arc<CommandQueue>,
}

impl CommandHandle {
    /// Submit a command and wait for its outcome. Operator transports use
    /// this to map results onto their own response format.
    pub fn execute(&self, command: Command) -> CommandOutcome {
        let (tx, rx) = mpsc::sync_channel(1);
        let accepted = self.queue.push(Envelope {
            command,
            reply: Some(tx),
            from_remote: false,
        });
        if !accepted {
            return CommandOutcome::Rejected("command pipeline is shut down".into());
        }
        rx.recv_timeout(REPLY_TIMEOUT)
            .unwrap_or_else(|_| CommandOutcome::Rejected("arbiter did not respond".into()))
    }

    /// Fire-and-forget submission from an operator source.
    pub fn submit(&self, command: Command) {
        self.queue.push(Envelope {
            command,
            reply: None,
            from_remote: false,
        });
    }

    /// Fire-and-forget submission from the joystick or detector path;
    /// feeds the idle watchdog.
    pub fn submit_remote(&self, command: Command) {
        self.queue.push(Envelope {
            command,
            reply: None,
            from_remote: true,
        });
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Runtime wiring for the consumer thread.
pub(crate) struct ArbiterContext {
    pub tracker: Arc<TrackingController>,
    pub laser: Arc<LaserSafetyController>,
    pub errors: Arc<ErrorLog>,
    pub idle_timeout: Duration,
    pub default_pulse: Duration,
    pub auto_fire: Arc<AtomicBool>,
}

pub(crate) fn new_queue() -> (Arc<CommandQueue>, CommandHandle) {
    let queue = Arc::new(CommandQueue::new());
    let handle = CommandHandle {
        queue: Arc::clone(&queue),
    };
    (queue, handle)
}

pub(crate) fn close_queue(queue: &CommandQueue) {
    queue.close();
}

/// Consumer loop: dispatch commands, run the idle watchdog.
pub(crate) fn run(ctx: ArbiterContext, queue: Arc<CommandQueue>) {
    info!("command arbiter started");
    let tick = (ctx.idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut last_activity = Instant::now();
    let mut idle_released = false;

    loop {
        match queue.pop(tick) {
            Popped::Closed => break,
            Popped::TimedOut => {
                if !idle_released && last_activity.elapsed() >= ctx.idle_timeout {
                    warn!(
                        "no input for {:?}, releasing motors and disarming laser",
                        ctx.idle_timeout
                    );
                    if let Err(err) = ctx.tracker.disable() {
                        ctx.errors.record(&err);
                    }
                    ctx.laser.arm(false);
                    idle_released = true;
                }
            }
            Popped::Entry(envelope) => {
                // Only joystick/detector traffic counts as input for the
                // watchdog; operator commands do not keep the turret awake.
                if envelope.from_remote {
                    last_activity = Instant::now();
                }
                if idle_released && envelope.command.reasserts_enable() {
                    debug!("first command after idle release, re-enabling motors");
                    if let Err(err) = ctx.tracker.enable() {
                        ctx.errors.record(&err);
                    }
                    idle_released = false;
                    // Restart the idle clock so the wake-up is not undone
                    // on the very next tick.
                    last_activity = Instant::now();
                }
                let outcome = dispatch(&ctx, envelope.command);
                if let Some(reply) = envelope.reply {
                    let _ = reply.send(outcome);
                }
            }
        }
    }
    info!("command arbiter stopped");
}

fn dispatch(ctx: &ArbiterContext, command: Command) -> CommandOutcome {
    let result = match command {
        Command::Jog {
            axis,
            steps,
            direction,
        } => {
            let delta = match direction {
                Direction::Cw => steps as i64,
                Direction::Ccw => -(steps as i64),
            };
            match axis {
                AxisId::X => ctx.tracker.move_by(delta, 0),
                AxisId::Y => ctx.tracker.move_by(0, delta),
            }
        }
        Command::MoveAbsolute { x_steps, y_steps } => ctx.tracker.move_absolute(x_steps, y_steps),
        Command::CenterOnPixel {
            x,
            y,
            frame_w,
            frame_h,
        } => ctx.tracker.center_on_pixel(x, y, frame_w, frame_h).map(|_| ()),
        Command::TrackTarget {
            cx,
            cy,
            frame_w,
            frame_h,
            ts,
        } => {
            let tracked = ctx.tracker.track_target(cx, cy, frame_w, frame_h, ts);
            if tracked.is_ok() && ctx.auto_fire.load(Ordering::SeqCst) {
                auto_fire(ctx);
            }
            tracked
        }
        Command::SetMode(request) => ctx.tracker.set_mode(request),
        Command::Home => ctx.tracker.home(),
        Command::SetHome => {
            ctx.tracker.set_home_here();
            Ok(())
        }
        Command::Disable => ctx.tracker.disable(),
        Command::Enable => ctx.tracker.enable(),
        Command::LaserArm(enable) => {
            ctx.laser.arm(enable);
            Ok(())
        }
        Command::LaserSetPower(pct) => {
            ctx.laser.set_power(pct);
            Ok(())
        }
        Command::LaserFire { duration_ms } => ctx.laser.fire(Duration::from_millis(duration_ms)),
        Command::LaserBurst {
            count,
            on_ms,
            off_ms,
        } => ctx.laser.burst(
            count,
            Duration::from_millis(on_ms),
            Duration::from_millis(off_ms),
        ),
    };

    match result {
        Ok(()) => CommandOutcome::Ok,
        Err(err) => {
            ctx.errors.record(&err);
            warn!("command rejected: {err}");
            CommandOutcome::Rejected(err.to_string())
        }
    }
}

/// Fire on a fresh tracked target. Cooldown and busy rejections are the
/// expected steady state here, not faults.
fn auto_fire(ctx: &ArbiterContext) {
    match ctx.laser.fire(ctx.default_pulse) {
        Ok(()) => debug!("auto-fire triggered"),
        Err(TurretError::Cooldown) | Err(TurretError::Busy) => {}
        Err(TurretError::Disarmed) => {}
        Err(err) => {
            ctx.errors.record(&err);
            warn!("auto-fire failed: {err}");
        }
    }
}
