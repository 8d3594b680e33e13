use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{channel::TelemetryChannel, error::Error, paths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeState {
    pub autonomous: bool,
}

/// Autonomous/manual flag, synchronized both ways through `commands/autonomous`.
///
/// A local toggle takes effect immediately, before the store write lands, so
/// anything gated on the mode stops on the same tick the operator flips it.
pub struct ModeToggle {
    channel: TelemetryChannel,
    state: watch::Sender<ModeState>,
    task: JoinHandle<()>,
}

impl ModeToggle {
    pub fn spawn(channel: &TelemetryChannel) -> Self {
        let (state, _) = watch::channel(ModeState::default());
        let mut feed = channel.subscribe::<bool>(paths::AUTONOMOUS);
        let remote = state.clone();
        let task = tokio::spawn(async move {
            while let Some(autonomous) = feed.next().await {
                let next = ModeState {
                    autonomous: autonomous.unwrap_or(false),
                };
                let changed = remote.send_if_modified(|current| {
                    let changed = *current != next;
                    *current = next;
                    changed
                });
                if changed {
                    info!(autonomous = next.autonomous, "mode changed remotely");
                }
            }
        });
        Self {
            channel: channel.clone(),
            state,
            task,
        }
    }

    pub fn state(&self) -> ModeState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ModeState> {
        self.state.subscribe()
    }

    pub async fn set_autonomous(&self, autonomous: bool) -> Result<(), Error> {
        let previous = self.state.send_replace(ModeState { autonomous });
        info!(autonomous, "mode toggled");
        if let Err(err) = self.channel.write(paths::AUTONOMOUS, &autonomous).await {
            warn!(%err, autonomous, "failed to publish mode, reverting");
            self.state.send_replace(previous);
            return Err(err);
        }
        Ok(())
    }

    pub async fn toggle(&self) -> Result<bool, Error> {
        let autonomous = !self.state().autonomous;
        self.set_autonomous(autonomous).await?;
        Ok(autonomous)
    }
}

impl Drop for ModeToggle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
