//! A stand-in vehicle that speaks the same store keys as the real one.

use std::time::Duration;

use tank_link::{TelemetryChannel, paths};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const X_BOUNDS: (f64, f64) = (5.0, 95.0);
pub const Y_BOUNDS: (f64, f64) = (7.0, 93.0);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimState {
    pub tick: u64,
    pub distance: f64,
    pub x: f64,
    pub y: f64,
    pub shots: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            tick: 0,
            distance: 0.0,
            x: 50.0,
            y: 50.0,
            shots: 0,
        }
    }
}

impl SimState {
    /// Moves by `speed` along `angle` (radians, counter-clockwise from +x,
    /// screen y grows downwards) and clamps to the arena.
    pub fn drive(&mut self, speed: f64, angle: f64, gain: f64) {
        let x = self.x + speed * angle.cos() * gain;
        let y = self.y - speed * angle.sin() * gain;
        self.x = x.clamp(X_BOUNDS.0, X_BOUNDS.1);
        self.y = y.clamp(Y_BOUNDS.0, Y_BOUNDS.1);
    }
}

/// Triangle wave between `lo` and `hi` with the given period in ticks.
pub fn triangle(tick: u64, period: u64, lo: f64, hi: f64) -> f64 {
    let period = period.max(2);
    let phase = (tick % period) as f64 / period as f64;
    let unit = if phase < 0.5 {
        1.0 - 2.0 * phase
    } else {
        2.0 * phase - 1.0
    };
    lo + (hi - lo) * unit
}

pub struct VehicleSim {
    channel: TelemetryChannel,
    tick: Duration,
    period: u64,
    range: (f64, f64),
    gain: f64,
}

impl VehicleSim {
    pub fn new(channel: TelemetryChannel) -> Self {
        Self {
            channel,
            tick: Duration::from_millis(100),
            period: 80,
            range: (5.0, 60.0),
            gain: 2.0,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> (watch::Receiver<SimState>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(SimState::default());
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.run(tx) => {}
            }
            debug!("vehicle sim stopped");
        });
        (rx, task)
    }

    async fn run(self, tx: watch::Sender<SimState>) {
        let mut speed = self.channel.subscribe::<f64>(paths::MOVEMENT_SPEED);
        let mut angle = self.channel.subscribe::<f64>(paths::MOVEMENT_ANGLE);
        let mut fire = self.channel.subscribe::<bool>(paths::FIRE);
        let (mut cmd_speed, mut cmd_angle) = (0.0, 0.0);
        let mut state = SimState::default();
        let mut interval = tokio::time::interval(self.tick);
        info!(tick = ?self.tick, "vehicle sim running");
        loop {
            tokio::select! {
                Some(v) = speed.next() => cmd_speed = v.unwrap_or(0.0),
                Some(v) = angle.next() => cmd_angle = v.unwrap_or(0.0),
                Some(v) = fire.next() => {
                    if v == Some(true) {
                        state.shots += 1;
                        info!(shots = state.shots, "shot fired");
                        if let Err(err) = self.channel.write(paths::FIRE, &false).await {
                            warn!(%err, "failed to reset fire command");
                        }
                        tx.send_replace(state);
                    }
                }
                _ = interval.tick() => {
                    state.tick += 1;
                    state.distance = triangle(state.tick, self.period, self.range.0, self.range.1);
                    state.drive(cmd_speed, cmd_angle, self.gain);
                    if let Err(err) = self.channel.write(paths::SENSOR_DISTANCE, &state.distance).await {
                        warn!(%err, "failed to publish distance");
                    }
                    tx.send_replace(state);
                }
            }
        }
    }
}
