//! Derives the fire-enable signal from the streaming distance sensor.

use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{channel::TelemetryChannel, paths};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FireGateState {
    pub distance: Option<f64>,
    pub can_fire: bool,
}

/// A threshold crossing. Emitted once per crossing, never per reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEdge {
    /// The target came within range.
    Armed,
    /// The target left range, or the sensor went quiet.
    Disarmed,
}

pub fn can_fire(distance: Option<f64>, threshold: f64) -> bool {
    distance.is_some_and(|d| d < threshold)
}

#[derive(Debug, Clone)]
pub struct DistanceGate {
    threshold: f64,
    state: FireGateState,
}

impl DistanceGate {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            state: FireGateState::default(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn state(&self) -> FireGateState {
        self.state
    }

    /// Records a reading and returns the edge it caused, if any.
    pub fn observe(&mut self, distance: Option<f64>) -> Option<GateEdge> {
        let was = self.state.can_fire;
        let now = can_fire(distance, self.threshold);
        self.state = FireGateState {
            distance,
            can_fire: now,
        };
        match (was, now) {
            (false, true) => Some(GateEdge::Armed),
            (true, false) => Some(GateEdge::Disarmed),
            _ => None,
        }
    }

    /// Follows `sensor/distance` until the store goes away.
    pub fn spawn(self, channel: &TelemetryChannel) -> GateHandle {
        let (state_tx, state_rx) = watch::channel(self.state);
        let (edge_tx, _) = broadcast::channel(16);
        let mut feed = channel.subscribe::<f64>(paths::SENSOR_DISTANCE);
        let edges = edge_tx.clone();
        let mut gate = self;
        let task = tokio::spawn(async move {
            while let Some(distance) = feed.next().await {
                let edge = gate.observe(distance);
                state_tx.send_replace(gate.state());
                if let Some(edge) = edge {
                    info!(?distance, ?edge, threshold = gate.threshold, "gate crossing");
                    let _ = edges.send(edge);
                } else {
                    debug!(?distance, "distance reading");
                }
            }
        });
        GateHandle {
            state: state_rx,
            edges: edge_tx,
            task,
        }
    }
}

pub struct GateHandle {
    state: watch::Receiver<FireGateState>,
    edges: broadcast::Sender<GateEdge>,
    task: JoinHandle<()>,
}

impl GateHandle {
    pub fn state(&self) -> FireGateState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<FireGateState> {
        self.state.clone()
    }

    pub fn edges(&self) -> broadcast::Receiver<GateEdge> {
        self.edges.subscribe()
    }
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn can_fire_matches_threshold() {
        for (d, expected) in [
            (None, false),
            (Some(19.99), true),
            (Some(20.0), false),
            (Some(-1.0), true),
            (Some(f64::NAN), false),
        ] {
            assert_eq!(can_fire(d, 20.0), expected, "{d:?}");
        }
    }

    #[test]
    fn edge_once_per_crossing() {
        let mut gate = DistanceGate::new(20.0);
        let edges = [30.0, 25.0, 18.0, 12.0, 5.0, 22.0, 40.0, 10.0]
            .into_iter()
            .map(|d| gate.observe(Some(d)))
            .collect::<Vec<_>>();
        assert_eq!(
            edges,
            [
                None,
                None,
                Some(GateEdge::Armed),
                None,
                None,
                Some(GateEdge::Disarmed),
                None,
                Some(GateEdge::Armed),
            ]
        );
    }

    #[test]
    fn losing_the_sensor_disarms() {
        let mut gate = DistanceGate::new(20.0);
        assert_eq!(gate.observe(Some(5.0)), Some(GateEdge::Armed));
        assert_eq!(gate.observe(None), Some(GateEdge::Disarmed));
        assert_eq!(gate.state(), FireGateState::default());
    }

    #[tokio::test]
    async fn spawned_gate_follows_sensor() {
        let channel = TelemetryChannel::new(Arc::new(MemoryStore::new()));
        let handle = DistanceGate::new(20.0).spawn(&channel);
        let mut edges = handle.edges();
        let mut state = handle.watch();

        channel.write(paths::SENSOR_DISTANCE, &12.0).await.unwrap();
        assert_eq!(edges.recv().await.unwrap(), GateEdge::Armed);
        state.wait_for(|s| s.can_fire).await.unwrap();
        assert_eq!(handle.state().distance, Some(12.0));
    }
}
