//! Guards and runs one fire-and-capture cycle at a time.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    capture::{CaptureMode, CapturePipeline, CaptureResult},
    channel::TelemetryChannel,
    gate::FireGateState,
    incident::{IncidentLog, Persisted},
    paths,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FireState {
    #[default]
    Idle,
    Firing {
        episode: u64,
    },
    CoolingDown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FireReport {
    pub episode: u64,
    pub distance: Option<f64>,
    pub capture: CaptureResult,
    pub persisted: Persisted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    /// Nothing within range.
    OutOfRange,
    /// A cycle is already running or cooling down.
    Busy(FireState),
    Completed(FireReport),
}

struct Inner {
    channel: TelemetryChannel,
    capture: Arc<CapturePipeline>,
    log: IncidentLog,
    gate: watch::Receiver<FireGateState>,
    state: watch::Sender<FireState>,
    episodes: AtomicU64,
    cooldown: Duration,
}

#[derive(Clone)]
pub struct FireSequencer {
    inner: Arc<Inner>,
}

impl FireSequencer {
    pub fn new(
        channel: TelemetryChannel,
        capture: Arc<CapturePipeline>,
        log: IncidentLog,
        gate: watch::Receiver<FireGateState>,
        cooldown: Duration,
    ) -> Self {
        let (state, _) = watch::channel(FireState::Idle);
        Self {
            inner: Arc::new(Inner {
                channel,
                capture,
                log,
                gate,
                state,
                episodes: AtomicU64::new(0),
                cooldown,
            }),
        }
    }

    pub fn state(&self) -> FireState {
        *self.inner.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<FireState> {
        self.inner.state.subscribe()
    }

    /// Fires if the gate allows it and no cycle is in progress. The cycle
    /// runs on its own task, so dropping the returned future does not leave
    /// the sequencer stuck in `Firing`.
    pub async fn fire(&self) -> FireOutcome {
        let gate = *self.inner.gate.borrow();
        if !gate.can_fire {
            info!(distance = ?gate.distance, "fire rejected, out of range");
            return FireOutcome::OutOfRange;
        }
        let mut busy = None;
        let mut episode = 0;
        // check and set under the channel's lock, no await in between
        self.inner.state.send_if_modified(|state| {
            if *state != FireState::Idle {
                busy = Some(*state);
                return false;
            }
            episode = self.inner.episodes.fetch_add(1, Ordering::SeqCst) + 1;
            *state = FireState::Firing { episode };
            true
        });
        if let Some(state) = busy {
            info!(?state, "fire rejected, sequencer busy");
            return FireOutcome::Busy(state);
        }

        let inner = self.inner.clone();
        match tokio::spawn(inner.run(episode, gate.distance)).await {
            Ok(report) => FireOutcome::Completed(report),
            Err(err) => {
                // the cycle panicked; never leave the button dead
                error!(%err, episode, "fire cycle aborted");
                self.inner.finish(episode);
                FireOutcome::Busy(self.state())
            }
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, episode: u64, distance: Option<f64>) -> FireReport {
        info!(episode, ?distance, "firing");
        if let Err(err) = self.channel.write(paths::FIRE, &true).await {
            warn!(%err, episode, "failed to send fire command");
        }
        let capture = self.capture.capture(CaptureMode::Fire).await;
        let persisted = self.log.persist_capture(&capture, distance).await;
        self.finish(episode);
        FireReport {
            episode,
            distance,
            capture,
            persisted,
        }
    }

    /// Leaves `Firing` for `CoolingDown` and schedules the return to `Idle`.
    fn finish(self: &Arc<Self>, episode: u64) {
        let entered = self.state.send_if_modified(|state| {
            if *state == (FireState::Firing { episode }) {
                *state = FireState::CoolingDown;
                true
            } else {
                false
            }
        });
        if !entered {
            return;
        }
        info!(episode, cooldown = ?self.cooldown, "cooling down");
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.cooldown).await;
            inner.state.send_if_modified(|state| {
                if *state == FireState::CoolingDown {
                    *state = FireState::Idle;
                    true
                } else {
                    false
                }
            });
            info!(episode, "ready to fire");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::CaptureSource,
        classifier::Classifier,
        config::{CaptureConfig, ReportConfig},
        store::{MemoryStore, RecordingStore},
    };

    struct Rig {
        store: Arc<RecordingStore<MemoryStore>>,
        gate: watch::Sender<FireGateState>,
        fire: FireSequencer,
    }

    fn rig() -> Rig {
        let store = Arc::new(RecordingStore::new(MemoryStore::new()));
        let channel = TelemetryChannel::new(store.clone());
        let (gate, gate_rx) = watch::channel(FireGateState::default());
        let capture = Arc::new(CapturePipeline::new(Classifier::new(), CaptureConfig::default()));
        let log = IncidentLog::new(channel.clone(), ReportConfig::default());
        let fire = FireSequencer::new(channel, capture, log, gate_rx, Duration::from_secs(5));
        Rig { store, gate, fire }
    }

    fn in_range(distance: f64) -> FireGateState {
        FireGateState {
            distance: Some(distance),
            can_fire: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_is_a_no_op() {
        let rig = rig();
        assert_eq!(rig.fire.fire().await, FireOutcome::OutOfRange);
        assert!(rig.store.writes().is_empty());
        assert_eq!(rig.fire.state(), FireState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_returns_to_idle_after_cooldown() {
        let rig = rig();
        rig.gate.send_replace(in_range(12.0));
        let FireOutcome::Completed(report) = rig.fire.fire().await else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.episode, 1);
        assert_eq!(report.capture.source, CaptureSource::Placeholder);
        assert!(report.persisted.record_id.is_some());
        assert_eq!(rig.fire.state(), FireState::CoolingDown);
        assert_eq!(rig.store.writes_to(paths::FIRE), vec![serde_json::json!(true)]);

        assert_eq!(
            rig.fire.fire().await,
            FireOutcome::Busy(FireState::CoolingDown)
        );
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(rig.fire.state(), FireState::CoolingDown);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rig.fire.state(), FireState::Idle);

        let FireOutcome::Completed(report) = rig.fire.fire().await else {
            panic!("expected a second cycle");
        };
        assert_eq!(report.episode, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_cycle() {
        let rig = rig();
        rig.gate.send_replace(in_range(5.0));
        let (a, b, c) = tokio::join!(rig.fire.fire(), rig.fire.fire(), rig.fire.fire());
        let completed = [&a, &b, &c]
            .iter()
            .filter(|o| matches!(o, FireOutcome::Completed(_)))
            .count();
        assert_eq!(completed, 1);
        assert_eq!(rig.store.writes_to(paths::FIRE).len(), 1);
        assert_eq!(rig.store.writes_under(paths::HISTORY).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_still_cools_down() {
        let rig = rig();
        rig.store.inner().set_offline(true);
        rig.gate.send_replace(in_range(5.0));
        let FireOutcome::Completed(report) = rig.fire.fire().await else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.persisted, Persisted::default());
        assert_eq!(rig.fire.state(), FireState::CoolingDown);
    }
}
