use std::{sync::Arc, time::Duration};

use tank_link::{
    Config, Console, MemoryStore, RecordingStore, TelemetryChannel,
    fire::FireOutcome,
    movement::JoystickEvent,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::StoreArgs;
use crate::sim::VehicleSim;

#[derive(clap::Args, Debug, Clone)]
pub struct Args {
    #[clap(flatten)]
    pub store: StoreArgs,
    /// How long the scripted operator drives, in seconds
    #[arg(long, default_value_t = 30)]
    pub seconds: u64,
    /// Camera address to publish before the session starts
    #[arg(long)]
    pub camera_ip: Option<String>,
}

impl Args {
    pub async fn run(&self, config: Config) -> miette::Result<()> {
        let store = Arc::new(RecordingStore::new(MemoryStore::open(&self.store.store)?));
        let channel = TelemetryChannel::new(store.clone());
        if let Some(ip) = &self.camera_ip {
            channel.write(&config.camera.ip_path, ip.as_str()).await?;
        }

        let cancel = CancellationToken::new();
        let (sim, sim_task) = VehicleSim::new(channel.clone()).spawn(cancel.clone());
        let console = Console::start(channel, &config);
        console.set_authenticated(true);

        let stop = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                stop.cancel();
            }
        });

        info!(seconds = self.seconds, "session started");
        let tally = Operator::default()
            .drive(&console, Duration::from_secs(self.seconds), cancel.clone())
            .await;
        cancel.cancel();
        let _ = sim_task.await;

        let records = console.history().list().await?;
        let shots = sim.borrow().shots;
        println!("shots fired        {shots}");
        println!("fire clicks        {}", tally.clicks);
        println!("completed cycles   {}", tally.completed);
        println!("rejected clicks    {}", tally.rejected);
        println!("joystick samples   {}", tally.moves);
        println!("mode changes       {}", tally.toggles);
        println!("incidents stored   {}", records.len());
        for advisory in console.advisories() {
            println!("advisory           {advisory:?}");
        }
        for (path, count) in store.counts() {
            println!("{count:>6}  {path}");
        }

        drop(console);
        store.inner().save()?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub clicks: u32,
    pub completed: u32,
    pub rejected: u32,
    pub moves: u32,
    pub toggles: u32,
}

/// Scripted stand-in for a person at the console.
#[derive(Debug, Default)]
pub struct Operator {
    step: u64,
    tally: Tally,
}

impl Operator {
    const PERIOD: Duration = Duration::from_millis(200);

    pub async fn drive(mut self, console: &Console, duration: Duration, cancel: CancellationToken) -> Tally {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(Self::PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut deadline => break,
                _ = ticker.tick() => self.step(console).await,
            }
        }
        // let go of the stick before walking away
        let _ = console.joystick().send(JoystickEvent::End).await;
        self.tally
    }

    async fn step(&mut self, console: &Console) {
        self.step += 1;
        let event = if self.step % 25 == 0 {
            JoystickEvent::End
        } else {
            let angle = self.step as f64 * 0.2 + fastrand::f64() * 0.1;
            JoystickEvent::from_force(0.6 + fastrand::f64() * 1.4, angle)
        };
        if console.joystick().send(event).await.is_ok() {
            self.tally.moves += 1;
        }

        if self.step % 100 == 50 || self.step % 100 == 75 {
            match console.toggle_mode().await {
                Ok(autonomous) => {
                    self.tally.toggles += 1;
                    info!(autonomous, "operator switched mode");
                }
                Err(err) => warn!(%err, "mode switch failed"),
            }
        }

        if console.fire_button_enabled() {
            self.tally.clicks += 1;
            match console.fire().await {
                FireOutcome::Completed(report) => {
                    self.tally.completed += 1;
                    info!(
                        episode = report.episode,
                        label = %report.capture.label,
                        source = ?report.capture.source,
                        "operator fired"
                    );
                }
                outcome => {
                    self.tally.rejected += 1;
                    info!(?outcome, "fire rejected");
                }
            }
        }
    }
}
