//! The operator console: every component wired to one channel.

use std::sync::{Arc, Mutex};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    camera::{CameraFeed, CameraFetcher, CameraWatcher},
    capture::{CapturePipeline, FrameSlot, HttpFetcher},
    channel::TelemetryChannel,
    classifier::{Classifier, FileModelLoader, ModelState},
    config::Config,
    error::Error,
    fire::{FireOutcome, FireReport, FireSequencer, FireState},
    gate::{DistanceGate, FireGateState, GateHandle},
    incident::{IncidentLog, IncidentRecord, ReportDraft},
    mode::{ModeState, ModeToggle},
    movement::{JoystickEvent, MovementEmitter},
    surveillance::{Analysis, Surveillance},
};

/// Banners shown next to the controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    ModelLoading,
    CameraMissing,
    CameraError(String),
    FireSuccess,
    ReadyToFire,
}

pub struct Console {
    gate: GateHandle,
    mode: ModeToggle,
    authenticated: watch::Sender<bool>,
    joystick: mpsc::Sender<JoystickEvent>,
    movement: JoinHandle<()>,
    classifier: Classifier,
    slot: Arc<FrameSlot>,
    camera: CameraWatcher,
    fire: FireSequencer,
    surveillance: Surveillance,
    log: IncidentLog,
    last_fire: Mutex<Option<FireReport>>,
}

impl Console {
    /// Starts every component against `channel`. The operator starts signed
    /// out; see [`Console::set_authenticated`].
    pub fn start(channel: TelemetryChannel, config: &Config) -> Self {
        let gate = DistanceGate::new(config.gate.threshold).spawn(&channel);
        let mode = ModeToggle::spawn(&channel);
        let (authenticated, auth_rx) = watch::channel(false);
        let (joystick, movement) = MovementEmitter::new(
            channel.clone(),
            mode.watch(),
            auth_rx,
            config.movement.min_interval(),
        )
        .spawn();

        let classifier = Classifier::new();
        if let Some(path) = &config.classifier.model {
            classifier.load(FileModelLoader::new(path));
        }

        let client = reqwest::Client::new();
        let slot = Arc::new(FrameSlot::new());
        let camera = CameraWatcher::spawn(&channel, &config.camera, client.clone(), slot.clone());
        let fetcher = CameraFetcher::new(
            HttpFetcher::new(client, config.capture.fetch_timeout()),
            camera.watch(),
        );
        let capture = Arc::new(
            CapturePipeline::new(classifier.clone(), config.capture.clone())
                .with_fetcher(Arc::new(fetcher))
                .with_element(slot.clone()),
        );

        let log = IncidentLog::new(channel.clone(), config.report.clone());
        let fire = FireSequencer::new(
            channel.clone(),
            capture.clone(),
            log.clone(),
            gate.watch(),
            config.fire.cooldown(),
        );
        let surveillance = Surveillance::spawn(gate.edges(), gate.watch(), capture);
        info!(threshold = config.gate.threshold, "console started");

        Self {
            gate,
            mode,
            authenticated,
            joystick,
            movement,
            classifier,
            slot,
            camera,
            fire,
            surveillance,
            log,
            last_fire: Mutex::new(None),
        }
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.send_replace(authenticated);
        info!(authenticated, "operator session changed");
    }

    pub fn joystick(&self) -> mpsc::Sender<JoystickEvent> {
        self.joystick.clone()
    }

    pub async fn set_autonomous(&self, autonomous: bool) -> Result<(), Error> {
        self.mode.set_autonomous(autonomous).await
    }

    pub async fn toggle_mode(&self) -> Result<bool, Error> {
        self.mode.toggle().await
    }

    pub fn mode(&self) -> ModeState {
        self.mode.state()
    }

    pub fn gate(&self) -> FireGateState {
        self.gate.state()
    }

    pub fn gate_watch(&self) -> watch::Receiver<FireGateState> {
        self.gate.watch()
    }

    pub fn fire_state(&self) -> FireState {
        self.fire.state()
    }

    pub fn fire_watch(&self) -> watch::Receiver<FireState> {
        self.fire.watch()
    }

    pub fn camera(&self) -> CameraFeed {
        self.camera.feed()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn latest_analysis(&self) -> Option<Analysis> {
        self.surveillance.latest()
    }

    pub fn fire_button_enabled(&self) -> bool {
        self.gate.state().can_fire && self.fire.state() == FireState::Idle
    }

    pub async fn fire(&self) -> FireOutcome {
        let outcome = self.fire.fire().await;
        if let FireOutcome::Completed(report) = &outcome {
            if let Ok(mut last) = self.last_fire.lock() {
                *last = Some(report.clone());
            }
        }
        outcome
    }

    pub fn advisories(&self) -> Vec<Advisory> {
        let mut out = Vec::new();
        if self.classifier.state().is_loading() {
            out.push(Advisory::ModelLoading);
        }
        match self.camera.feed() {
            CameraFeed::Missing => out.push(Advisory::CameraMissing),
            CameraFeed::Streaming { .. } => {
                if let Some(err) = self.slot.error() {
                    out.push(Advisory::CameraError(err));
                }
            }
            CameraFeed::Waiting => {}
        }
        if self.fire.state() == FireState::CoolingDown {
            out.push(Advisory::FireSuccess);
        }
        if self.fire_button_enabled() {
            out.push(Advisory::ReadyToFire);
        }
        out
    }

    /// Opens a report on this console's most recent capture, or on the
    /// latest-photo slot if this console has not fired yet.
    pub async fn open_report(&self) -> Result<ReportDraft, Error> {
        let last = self.last_fire.lock().ok().and_then(|last| last.clone());
        match last {
            Some(report) => {
                debug!(episode = report.episode, "report on own capture");
                Ok(ReportDraft::with_capture(&report.capture, report.distance))
            }
            None => self.log.draft_from_latest().await,
        }
    }

    pub async fn submit_report(&self, draft: &ReportDraft) -> Result<IncidentRecord, Error> {
        self.log.submit_report(draft).await
    }

    pub fn history(&self) -> &IncidentLog {
        &self.log
    }

    pub fn model_state(&self) -> ModelState {
        self.classifier.state()
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.movement.abort();
    }
}
