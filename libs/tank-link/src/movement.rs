//! Turns joystick input into rate limited movement commands.

use std::{f64::consts::PI, time::Duration};

use serde_json::json;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{channel::TelemetryChannel, mode::ModeState, paths};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JoystickEvent {
    /// Polar sample, `speed` in `[0, 1]` and `angle` in radians.
    Move { speed: f64, angle: f64 },
    /// Cartesian sample, each axis in `[-1, 1]`.
    Vector { x: f64, y: f64 },
    /// Pointer released.
    End,
}

impl JoystickEvent {
    /// Joystick widgets report an unbounded force that reaches 2.0 at the
    /// edge of the pad.
    pub fn from_force(force: f64, angle: f64) -> Self {
        JoystickEvent::Move {
            speed: (force / 2.0).min(1.0),
            angle,
        }
    }

    /// A sample with a NaN or infinite component carries no usable direction.
    pub fn is_finite(&self) -> bool {
        match *self {
            JoystickEvent::Move { speed, angle } => speed.is_finite() && angle.is_finite(),
            JoystickEvent::Vector { x, y } => x.is_finite() && y.is_finite(),
            JoystickEvent::End => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MovementCommand {
    /// `[0, 1]`
    pub speed: f64,
    /// radians
    pub angle: f64,
}

impl MovementCommand {
    pub const STOP: MovementCommand = MovementCommand {
        speed: 0.0,
        angle: 0.0,
    };

    fn from_event(event: JoystickEvent) -> Self {
        match event {
            JoystickEvent::Move { speed, angle } => MovementCommand {
                speed: speed.clamp(0.0, 1.0),
                angle,
            },
            JoystickEvent::Vector { x, y } => {
                let angle = y.atan2(x);
                MovementCommand {
                    speed: x.hypot(y).min(1.0),
                    angle: if angle < 0.0 { angle + 2.0 * PI } else { angle },
                }
            }
            JoystickEvent::End => Self::STOP,
        }
    }
}

/// Whether input is currently wired to the channel. Detached while the
/// vehicle drives itself or nobody is signed in.
enum Listener {
    Detached,
    Attached {
        last_write: Option<Instant>,
        pending: Option<MovementCommand>,
    },
}

impl Listener {
    fn attached() -> Self {
        Listener::Attached {
            last_write: None,
            pending: None,
        }
    }

    fn deadline(&self, min_interval: Duration) -> Option<Instant> {
        match self {
            Listener::Attached {
                last_write: Some(last),
                pending: Some(_),
            } => Some(*last + min_interval),
            _ => None,
        }
    }
}

pub struct MovementEmitter {
    channel: TelemetryChannel,
    mode: watch::Receiver<ModeState>,
    authenticated: watch::Receiver<bool>,
    min_interval: Duration,
}

impl MovementEmitter {
    pub fn new(
        channel: TelemetryChannel,
        mode: watch::Receiver<ModeState>,
        authenticated: watch::Receiver<bool>,
        min_interval: Duration,
    ) -> Self {
        Self {
            channel,
            mode,
            authenticated,
            min_interval,
        }
    }

    /// Runs the emitter on its own task, fed by the returned sender.
    pub fn spawn(self) -> (mpsc::Sender<JoystickEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(self.run(rx));
        (tx, task)
    }

    fn wants_input(&self) -> bool {
        !self.mode.borrow().autonomous && *self.authenticated.borrow()
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<JoystickEvent>) {
        let mut listener = if self.wants_input() {
            Listener::attached()
        } else {
            Listener::Detached
        };
        loop {
            let deadline = listener.deadline(self.min_interval);
            tokio::select! {
                biased;
                res = self.mode.changed() => {
                    if res.is_err() {
                        break;
                    }
                    self.mode.borrow_and_update();
                    listener = self.reattach(listener);
                }
                res = self.authenticated.changed() => {
                    if res.is_err() {
                        break;
                    }
                    self.authenticated.borrow_and_update();
                    listener = self.reattach(listener);
                }
                _ = sleep_until(deadline) => {
                    if let Listener::Attached { last_write, pending } = &mut listener {
                        if let Some(cmd) = pending.take() {
                            self.emit(cmd).await;
                            *last_write = Some(Instant::now());
                        }
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    // the mode may have flipped since the last wakeup
                    listener = self.reattach(listener);
                    self.handle(&mut listener, event).await;
                }
            }
        }
        debug!("movement emitter stopped");
    }

    fn reattach(&self, listener: Listener) -> Listener {
        match (listener, self.wants_input()) {
            (Listener::Detached, true) => {
                info!("joystick attached");
                Listener::attached()
            }
            (Listener::Attached { .. }, false) => {
                info!("joystick detached");
                Listener::Detached
            }
            (listener, _) => listener,
        }
    }

    async fn handle(&self, listener: &mut Listener, event: JoystickEvent) {
        let Listener::Attached {
            last_write,
            pending,
        } = listener
        else {
            return;
        };
        if !event.is_finite() {
            warn!(?event, "ignoring non-finite joystick sample");
            return;
        }
        let cmd = MovementCommand::from_event(event);
        let now = Instant::now();
        let due = match (event, *last_write) {
            (JoystickEvent::End, _) | (_, None) => true,
            (_, Some(last)) => now.duration_since(last) >= self.min_interval,
        };
        if due {
            *pending = None;
            self.emit(cmd).await;
            *last_write = Some(now);
        } else {
            *pending = Some(cmd);
        }
    }

    async fn emit(&self, cmd: MovementCommand) {
        // a write can outlive a mode flip; check once more at the boundary
        if !self.wants_input() {
            return;
        }
        let res = self
            .channel
            .update(vec![
                (paths::MOVEMENT_SPEED, json!(cmd.speed)),
                (paths::MOVEMENT_ANGLE, json!(cmd.angle)),
            ])
            .await;
        match res {
            Ok(()) => debug!(speed = cmd.speed, angle = cmd.angle, "movement"),
            Err(err) => warn!(%err, "failed to write movement"),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
