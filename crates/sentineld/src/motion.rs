//! Motion detector runner.
//!
//! One tokio task owns the [`AnomalyDetector`], the alarm player and the
//! sensor subscriptions. Sensor samples arrive on one channel; control
//! commands and completion events on another. Only this task touches the
//! cooldown state. An alert stays in flight until its playback has finished
//! and, when contacts are notified, until that delivery has finished too.
//! Contact delivery is bounded by the alerter's delivery timeout and is never
//! cancelled once started, not even by muting or disarming.

use crate::alerting::ContactAlerter;
use sentinel_core::{AnomalyDetector, AnomalyPolicy, DetectorState, MotionSample, SensorKind, Trigger};
use sentinel_hw::{AlertPlayer, IioSensor, MotionSensor, SensorError, SensorSubscription};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const SAMPLE_QUEUE: usize = 64;

#[derive(Error, Debug)]
pub enum MotionError {
    #[error("no motion sensors available")]
    NoSensors,
    #[error("motion runner exited")]
    ChannelClosed,
}

/// Opens motion sensors on demand.
pub trait SensorProvider: Send + Sync {
    fn open(&self, kind: SensorKind) -> Result<Box<dyn MotionSensor>, SensorError>;
}

/// Sensors discovered through the IIO sysfs tree.
pub struct IioSensors;

impl SensorProvider for IioSensors {
    fn open(&self, kind: SensorKind) -> Result<Box<dyn MotionSensor>, SensorError> {
        Ok(Box::new(IioSensor::discover(kind)?))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MotionStatus {
    pub state: DetectorState,
    pub sound_alert_enabled: bool,
    pub alert_in_flight: bool,
    pub sensors: Vec<SensorKind>,
}

enum MotionEvent {
    Start(oneshot::Sender<Result<bool, MotionError>>),
    Stop(oneshot::Sender<bool>),
    SetSoundAlert(bool, oneshot::Sender<()>),
    Status(oneshot::Sender<MotionStatus>),
    PlaybackFinished(u64),
    ContactsNotified(u64),
}

/// Clone-safe handle to the motion runner task.
#[derive(Clone)]
pub struct MotionHandle {
    tx: mpsc::Sender<MotionEvent>,
}

impl MotionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> MotionEvent) -> Result<T, MotionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| MotionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| MotionError::ChannelClosed)
    }

    /// Arm the detector. `Ok(false)` if it was already armed.
    pub async fn start(&self) -> Result<bool, MotionError> {
        self.request(MotionEvent::Start).await?
    }

    /// Disarm. Idempotent; returns whether an alert was silenced.
    pub async fn stop(&self) -> Result<bool, MotionError> {
        self.request(MotionEvent::Stop).await
    }

    pub async fn set_sound_alert_enabled(&self, enabled: bool) -> Result<(), MotionError> {
        self.request(|reply| MotionEvent::SetSoundAlert(enabled, reply)).await
    }

    pub async fn status(&self) -> Result<MotionStatus, MotionError> {
        self.request(MotionEvent::Status).await
    }
}

struct InFlight {
    seq: u64,
    playback_done: bool,
    contacts_done: bool,
}

struct MotionRunner {
    detector: AnomalyDetector,
    player: Box<dyn AlertPlayer>,
    sensors: Arc<dyn SensorProvider>,
    interval: Duration,
    alerter: Arc<ContactAlerter>,
    subscriptions: Vec<SensorSubscription>,
    samples_tx: mpsc::Sender<MotionSample>,
    events_tx: mpsc::Sender<MotionEvent>,
    in_flight: Option<InFlight>,
}

/// Spawn the runner; the detector starts disarmed.
pub fn spawn_motion(
    policy: AnomalyPolicy,
    sound_alert_enabled: bool,
    player: Box<dyn AlertPlayer>,
    sensors: Arc<dyn SensorProvider>,
    interval: Duration,
    alerter: Arc<ContactAlerter>,
) -> MotionHandle {
    let (events_tx, mut events_rx) = mpsc::channel(16);
    let (samples_tx, mut samples_rx) = mpsc::channel(SAMPLE_QUEUE);

    let mut runner = MotionRunner {
        detector: AnomalyDetector::new(policy, sound_alert_enabled),
        player,
        sensors,
        interval,
        alerter,
        subscriptions: Vec::new(),
        samples_tx,
        events_tx: events_tx.clone(),
        in_flight: None,
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => runner.handle_event(event),
                    None => break,
                },
                Some(sample) = samples_rx.recv() => runner.handle_sample(&sample),
            }
        }
        runner.shutdown();
    });

    MotionHandle { tx: events_tx }
}

impl MotionRunner {
    fn handle_event(&mut self, event: MotionEvent) {
        match event {
            MotionEvent::Start(reply) => {
                let _ = reply.send(self.start());
            }
            MotionEvent::Stop(reply) => {
                let _ = reply.send(self.stop());
            }
            MotionEvent::SetSoundAlert(enabled, reply) => {
                if self.detector.set_sound_alert_enabled(enabled) {
                    self.silence();
                }
                tracing::info!(enabled, "sound alert setting changed");
                let _ = reply.send(());
            }
            MotionEvent::Status(reply) => {
                let _ = reply.send(MotionStatus {
                    state: self.detector.state(),
                    sound_alert_enabled: self.detector.sound_alert_enabled(),
                    alert_in_flight: self.detector.alert_in_flight(),
                    sensors: self.subscriptions.iter().map(|s| s.kind()).collect(),
                });
            }
            MotionEvent::PlaybackFinished(seq) => self.complete(seq, |f| f.playback_done = true),
            MotionEvent::ContactsNotified(seq) => self.complete(seq, |f| f.contacts_done = true),
        }
    }

    fn start(&mut self) -> Result<bool, MotionError> {
        if self.detector.state() != DetectorState::Stopped {
            return Ok(false);
        }
        for kind in [SensorKind::Accelerometer, SensorKind::Gyroscope] {
            let subscription = self
                .sensors
                .open(kind)
                .and_then(|sensor| SensorSubscription::spawn(sensor, self.interval, self.samples_tx.clone()));
            match subscription {
                Ok(sub) => self.subscriptions.push(sub),
                Err(e) => tracing::warn!(sensor = %kind, error = %e, "sensor unavailable"),
            }
        }
        if self.subscriptions.is_empty() {
            return Err(MotionError::NoSensors);
        }
        self.detector.start();
        tracing::info!(sensors = self.subscriptions.len(), "motion detector armed");
        Ok(true)
    }

    fn stop(&mut self) -> bool {
        let silenced = self.detector.stop();
        self.silence();
        let subscriptions = std::mem::take(&mut self.subscriptions);
        if !subscriptions.is_empty() {
            // Joining waits out one polling interval; keep that off the runtime.
            tokio::task::spawn_blocking(move || drop(subscriptions));
            tracing::info!("motion detector disarmed");
        }
        silenced
    }

    /// Stop playback and forget the in-flight alert. Contact delivery
    /// carries on detached; its completion event is then stale.
    fn silence(&mut self) {
        self.player.stop();
        if let Some(flight) = self.in_flight.take() {
            tracing::debug!(seq = flight.seq, "in-flight alert released");
        }
    }

    fn handle_sample(&mut self, sample: &MotionSample) {
        if let Some(trigger) = self.detector.on_sample(sample) {
            self.raise(trigger);
        }
    }

    fn raise(&mut self, trigger: Trigger) {
        tracing::warn!(
            sensor = %trigger.source,
            magnitude = trigger.magnitude,
            notify_contacts = trigger.notify_contacts,
            "suspicious movement"
        );
        let seq = trigger.seq;

        self.player.stop();
        let events = self.events_tx.clone();
        let playback_done = match self.player.play(Box::new(move || {
            let _ = events.try_send(MotionEvent::PlaybackFinished(seq));
        })) {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!(error = %e, "alarm playback failed");
                true
            }
        };

        if trigger.notify_contacts {
            let alerter = self.alerter.clone();
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                alerter.alert_contacts().await;
                let _ = events.send(MotionEvent::ContactsNotified(seq)).await;
            });
        }

        self.in_flight = Some(InFlight {
            seq,
            playback_done,
            contacts_done: !trigger.notify_contacts,
        });
        self.complete(seq, |_| {});
    }

    fn complete(&mut self, seq: u64, mark: impl FnOnce(&mut InFlight)) {
        let Some(flight) = self.in_flight.as_mut().filter(|f| f.seq == seq) else {
            return;
        };
        mark(flight);
        if flight.playback_done && flight.contacts_done {
            self.in_flight = None;
            self.detector.alert_finished(seq);
            tracing::debug!(seq, "alert handling finished");
        }
    }

    fn shutdown(&mut self) {
        self.detector.stop();
        self.silence();
        self.subscriptions.clear();
    }
}
