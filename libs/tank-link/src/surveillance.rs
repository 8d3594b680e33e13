use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    capture::{CaptureMode, CapturePipeline, CaptureResult},
    gate::{FireGateState, GateEdge},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub at: DateTime<Utc>,
    pub distance: Option<f64>,
    pub capture: CaptureResult,
}

/// Classifies a frame each time a target comes into range. Unlike a fire
/// capture this waits for the model.
pub struct Surveillance {
    latest: watch::Receiver<Option<Analysis>>,
    task: JoinHandle<()>,
}

impl Surveillance {
    pub fn spawn(
        mut edges: broadcast::Receiver<GateEdge>,
        gate: watch::Receiver<FireGateState>,
        capture: Arc<CapturePipeline>,
    ) -> Self {
        let (tx, latest) = watch::channel(None);
        let task = tokio::spawn(async move {
            loop {
                match edges.recv().await {
                    Ok(GateEdge::Armed) => {
                        let distance = gate.borrow().distance;
                        let result = capture.capture(CaptureMode::Analysis).await;
                        info!(?distance, label = %result.label, source = ?result.source, "target analysed");
                        tx.send_replace(Some(Analysis {
                            at: Utc::now(),
                            distance,
                            capture: result,
                        }));
                    }
                    Ok(GateEdge::Disarmed) => debug!("target left range"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "analysis fell behind the gate")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { latest, task }
    }

    pub fn latest(&self) -> Option<Analysis> {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Analysis>> {
        self.latest.clone()
    }
}

impl Drop for Surveillance {
    fn drop(&mut self) {
        self.task.abort();
    }
}
