//! Decoy shutdown controller.
//!
//! ```text
//! PowerMenuShown --power off/restart--> VerifyingFace --match--> Dismissed
//!                                             |
//!                                         no match / no face
//!                                             v
//!                                        ShowingDecoy --admin--> Locked
//!                                             |
//!                                             +--no admin--> AdminRequested
//! ```
//!
//! A lock or activation request that fails ends in `LockFailed`. The decoy
//! animation always runs to completion once started.

use crate::engine::{EngineHandle, VerifyOutcome};
use crate::responder::IntrusionResponder;
use crate::store::EnrollmentStore;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Two presses within this window raise the power menu.
pub const DOUBLE_PRESS_WINDOW: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum DecoyError {
    #[error("a power action is already in progress")]
    Busy,
    #[error("device admin action failed: {0}")]
    Admin(#[from] AdminError),
    #[error("decoy task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct AdminError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoyState {
    PowerMenuShown,
    VerifyingFace,
    Dismissed,
    ShowingDecoy,
    Locked,
    AdminRequested,
    LockFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    PowerOff,
    Restart,
    LockNow,
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "power-off" | "poweroff" | "shutdown" => Ok(PowerAction::PowerOff),
            "restart" | "reboot" => Ok(PowerAction::Restart),
            "lock" | "lock-now" => Ok(PowerAction::LockNow),
            other => Err(format!("unknown power action: {other}")),
        }
    }
}

/// Privileged lock capability of the platform.
#[async_trait]
pub trait DeviceAdmin: Send + Sync {
    fn is_admin_active(&self) -> bool;
    async fn request_admin_activation(&self) -> Result<(), AdminError>;
    async fn lock_now(&self) -> Result<(), AdminError>;
}

/// Locks every session through logind.
pub struct SessionLocker {
    enabled: bool,
}

impl SessionLocker {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl DeviceAdmin for SessionLocker {
    fn is_admin_active(&self) -> bool {
        self.enabled
    }

    async fn request_admin_activation(&self) -> Result<(), AdminError> {
        tracing::warn!("session locking is disabled; set SENTINEL_LOCK_SESSIONS=1 to allow it");
        Ok(())
    }

    async fn lock_now(&self) -> Result<(), AdminError> {
        let status = tokio::process::Command::new("loginctl")
            .arg("lock-sessions")
            .status()
            .await
            .map_err(|e| AdminError(format!("failed to run loginctl: {e}")))?;
        if !status.success() {
            return Err(AdminError(format!("loginctl lock-sessions exited with {status}")));
        }
        tracing::info!("sessions locked");
        Ok(())
    }
}

/// Runs one face verification for the owner.
#[async_trait]
pub trait FaceVerifier: Send + Sync {
    async fn verify(&self) -> VerifyOutcome;
}

/// Verifies the configured owner through the engine thread.
pub struct EngineVerifier {
    pub engine: EngineHandle,
    pub store: Arc<EnrollmentStore>,
    pub owner: String,
    pub timeout: Duration,
}

#[async_trait]
impl FaceVerifier for EngineVerifier {
    async fn verify(&self) -> VerifyOutcome {
        let gallery = match self.store.gallery(&self.owner) {
            Ok(gallery) => gallery,
            Err(e) => {
                tracing::warn!(owner = %self.owner, error = %e, "gallery unavailable; verifying against nobody");
                Vec::new()
            }
        };
        match self.engine.verify(gallery, self.timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "verification failed; treating as no match");
                VerifyOutcome::NoFaceDetected
            }
        }
    }
}

/// Duration of the fake shutdown screen and the blackout that follows.
#[derive(Debug, Clone, Copy)]
pub struct DecoyTiming {
    pub shutdown_screen: Duration,
    pub blackout: Duration,
}

impl Default for DecoyTiming {
    fn default() -> Self {
        Self {
            shutdown_screen: Duration::from_millis(3000),
            blackout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerOutcome {
    pub state: DecoyState,
    /// Saved intruder image, if one was recorded.
    pub evidence: Option<PathBuf>,
}

struct Shared {
    verifier: Arc<dyn FaceVerifier>,
    responder: Arc<IntrusionResponder>,
    admin: Arc<dyn DeviceAdmin>,
    decoy_on_match: bool,
    timing: DecoyTiming,
    state: Mutex<Option<DecoyState>>,
}

impl Shared {
    fn enter(&self, state: DecoyState) {
        tracing::info!(?state, "decoy flow");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    /// Always leaves the flow in a terminal state.
    async fn lock_or_request(&self) -> Result<DecoyState, AdminError> {
        let result = if self.admin.is_admin_active() {
            self.admin.lock_now().await.map(|()| DecoyState::Locked)
        } else {
            self.admin
                .request_admin_activation()
                .await
                .map(|()| DecoyState::AdminRequested)
        };
        match result {
            Ok(state) => {
                self.enter(state);
                Ok(state)
            }
            Err(e) => {
                tracing::error!(error = %e, "device lock failed");
                self.enter(DecoyState::LockFailed);
                Err(e)
            }
        }
    }

    async fn show_decoy(&self) {
        self.enter(DecoyState::ShowingDecoy);
        tokio::time::sleep(self.timing.shutdown_screen).await;
        tokio::time::sleep(self.timing.blackout).await;
    }

    async fn run(&self, action: PowerAction) -> Result<PowerOutcome, DecoyError> {
        if action == PowerAction::LockNow {
            let state = self.lock_or_request().await?;
            return Ok(PowerOutcome {
                state,
                evidence: None,
            });
        }

        self.enter(DecoyState::VerifyingFace);
        let outcome = self.verifier.verify().await;
        tracing::info!(?action, outcome = outcome.label(), "power action verification");

        let mut evidence = None;
        match outcome {
            VerifyOutcome::Matched { .. } if !self.decoy_on_match => {
                self.enter(DecoyState::Dismissed);
                return Ok(PowerOutcome {
                    state: DecoyState::Dismissed,
                    evidence: None,
                });
            }
            VerifyOutcome::Matched { .. } | VerifyOutcome::NoFaceDetected => {}
            VerifyOutcome::NotMatched { capture, .. } => {
                // Encoding and the file write block; delivery is spawned from there.
                let responder = self.responder.clone();
                evidence = tokio::task::spawn_blocking(move || responder.respond(&capture).saved)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "intruder response failed");
                        None
                    });
            }
        }

        self.show_decoy().await;
        let state = self.lock_or_request().await?;
        Ok(PowerOutcome { state, evidence })
    }
}

pub struct DecoyController {
    shared: Arc<Shared>,
}

impl DecoyController {
    pub fn new(
        verifier: Arc<dyn FaceVerifier>,
        responder: Arc<IntrusionResponder>,
        admin: Arc<dyn DeviceAdmin>,
        decoy_on_match: bool,
        timing: DecoyTiming,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                verifier,
                responder,
                admin,
                decoy_on_match,
                timing,
                state: Mutex::new(None),
            }),
        }
    }

    /// Current or last state of the flow.
    pub fn state(&self) -> Option<DecoyState> {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn show_power_menu(&self) {
        self.shared.enter(DecoyState::PowerMenuShown);
    }

    /// Handle a power menu choice.
    ///
    /// The flow runs on its own task, so dropping this future does not cut
    /// the decoy short. Only one flow runs at a time.
    pub async fn power_action(&self, action: PowerAction) -> Result<PowerOutcome, DecoyError> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, Some(DecoyState::VerifyingFace | DecoyState::ShowingDecoy)) {
                return Err(DecoyError::Busy);
            }
            if action != PowerAction::LockNow {
                *state = Some(DecoyState::VerifyingFace);
            }
        }
        let shared = self.shared.clone();
        match tokio::spawn(async move { shared.run(action).await }).await {
            Ok(result) => result,
            Err(e) => {
                self.shared.enter(DecoyState::LockFailed);
                Err(e.into())
            }
        }
    }
}

/// Raises the power menu on a double press of the power button.
#[derive(Debug, Default)]
pub struct PowerButtonWatch {
    last_press: Option<Instant>,
}

impl PowerButtonWatch {
    /// Record a press. True when it completes a double press.
    pub fn press(&mut self, now: Instant) -> bool {
        match self.last_press.take() {
            Some(prev) if now.saturating_duration_since(prev) <= DOUBLE_PRESS_WINDOW => true,
            _ => {
                self.last_press = Some(now);
                false
            }
        }
    }
}
