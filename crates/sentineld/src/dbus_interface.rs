use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use zbus::interface;
use zbus::message::Header;

use sentinel_core::{Credential, LockMethod, LockVerifier};

use crate::access;
use crate::config::Config;
use crate::contacts::ContactsStore;
use crate::credentials::{CredentialStore, Gatekeeper};
use crate::decoy::{DecoyController, PowerAction, PowerButtonWatch};
use crate::engine::EngineHandle;
use crate::motion::MotionHandle;
use crate::rate_limiter::RateLimiter;
use crate::settings::SettingsStore;
use crate::store::{EnrollmentStore, StoreError};

pub const BUS_NAME: &str = "org.sentinel.Sentinel1";
pub const OBJECT_PATH: &str = "/org/sentinel/Sentinel1";

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: Arc<EnrollmentStore>,
    pub settings: SettingsStore,
    pub credentials: CredentialStore,
    pub contacts: ContactsStore,
    pub motion: MotionHandle,
    pub decoy: Arc<DecoyController>,
    pub power_button: PowerButtonWatch,
    pub unlock_attempts: RateLimiter,
}

/// D-Bus interface for the Sentinel anti-theft daemon.
///
/// Bus name: org.sentinel.Sentinel1
/// Object path: /org/sentinel/Sentinel1
pub struct SentinelService {
    pub state: Arc<Mutex<AppState>>,
}

/// Log `e` and turn it into a D-Bus failure reply.
fn failed<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> zbus::fdo::Error {
    move |e| {
        tracing::error!(error = %e, "{context}");
        zbus::fdo::Error::Failed(format!("{context}: {e}"))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed("failed to encode reply"))
}

fn parse_method(method: &str) -> zbus::fdo::Result<LockMethod> {
    method
        .parse()
        .map_err(|e: sentinel_core::lock::UnknownLockMethod| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

/// Refuse an unlock attempt while `method` is locked out.
fn admit_attempt(limiter: &mut RateLimiter, method: LockMethod, now: Instant) -> zbus::fdo::Result<()> {
    limiter.check(method.as_str(), now).map_err(|remaining| {
        tracing::warn!(method = %method, "unlock rate limited");
        zbus::fdo::Error::LimitsExceeded(format!(
            "too many failed attempts; try again in {}s",
            remaining.as_secs().max(1)
        ))
    })
}

fn record_attempt(limiter: &mut RateLimiter, method: LockMethod, accepted: bool, now: Instant) {
    if accepted {
        limiter.record_success(method.as_str());
    } else {
        limiter.record_failure(method.as_str(), now);
    }
}

/// Replace a PIN or password. Once one is set, `current` must match it.
fn replace_secret(
    credentials: &mut CredentialStore,
    limiter: &mut RateLimiter,
    method: LockMethod,
    current: &str,
    secret: &str,
    now: Instant,
) -> zbus::fdo::Result<()> {
    if credentials.has_secret(method) {
        admit_attempt(limiter, method, now)?;
        let accepted = credentials.verify_secret(method, current);
        record_attempt(limiter, method, accepted, now);
        if !accepted {
            tracing::warn!(method = %method, "secret change refused: current secret wrong");
            return Err(zbus::fdo::Error::AccessDenied(format!("current {method} is wrong")));
        }
    }
    credentials
        .set_secret(method, secret)
        .map_err(failed("failed to store secret"))
}

impl SentinelService {
    /// On the system bus, allow only root or the account named `user`.
    /// `None` stands for the device owner.
    async fn authorize_caller(
        &self,
        user: Option<&str>,
        header: &Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        // Read what we need without holding the lock across the UID lookup
        let (session_bus, owner) = {
            let state = self.state.lock().await;
            (state.config.session_bus, state.config.owner.clone())
        };
        if session_bus {
            return Ok(());
        }
        let caller = access::caller_uid(header, conn).await?;
        access::authorize(caller, user.unwrap_or(&owner), access::uid_for_name)?;
        Ok(())
    }
}

#[interface(name = "org.sentinel.Sentinel1")]
impl SentinelService {
    /// Enroll the face currently held inside the guide region.
    ///
    /// Returns the id of the new enrollment record.
    async fn enroll(
        &self,
        user: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(user, "enroll requested");
        self.authorize_caller(Some(user), &header, conn).await?;

        // Copy values while holding lock, then release
        let (engine, store, region, dwell, timeout) = {
            let state = self.state.lock().await;
            (
                state.engine.clone(),
                state.store.clone(),
                state.config.guide_region,
                state.config.dwell(),
                state.config.enroll_timeout(),
            )
        };

        let signature = engine
            .enroll(region, dwell, timeout)
            .await
            .map_err(failed("enrollment failed"))?;
        let id = store
            .enroll(user, &signature)
            .map_err(failed("enrollment not saved"))?;

        tracing::info!(user, id = %id, "enrolled successfully");
        Ok(id)
    }

    /// Verify the current face against the user's enrollments.
    async fn verify(
        &self,
        user: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(user, "verify requested");
        self.authorize_caller(Some(user), &header, conn).await?;
        let (engine, store, timeout) = {
            let state = self.state.lock().await;
            (state.engine.clone(), state.store.clone(), state.config.verify_timeout())
        };
        let gallery = store.gallery(user).map_err(failed("failed to read enrollments"))?;
        let outcome = engine
            .verify(gallery, timeout)
            .await
            .map_err(failed("verification failed"))?;
        tracing::info!(user, outcome = outcome.label(), "verify complete");
        Ok(outcome.is_match())
    }

    /// List enrollment records for the user, as JSON.
    async fn list_models(
        &self,
        user: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize_caller(Some(user), &header, conn).await?;
        let store = self.state.lock().await.store.clone();
        let gallery = store.gallery(user).map_err(failed("failed to read enrollments"))?;
        let models: Vec<_> = gallery
            .iter()
            .map(|r| serde_json::json!({ "id": r.id, "created_at": r.created_at }))
            .collect();
        to_json(&models)
    }

    /// Remove one enrollment. False if no such record exists.
    async fn remove_model(
        &self,
        user: &str,
        model_id: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(user, model_id, "remove_model requested");
        self.authorize_caller(Some(user), &header, conn).await?;
        let store = self.state.lock().await.store.clone();
        match store.delete(user, model_id) {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => {
                tracing::info!(user, model_id, "remove_model: no such record");
                Ok(false)
            }
            Err(e) => Err(failed("failed to remove enrollment")(e)),
        }
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (motion, config, settings, decoy, store, contacts, secrets) = {
            let state = self.state.lock().await;
            (
                state.motion.clone(),
                state.config.clone(),
                state.settings.get(),
                state.decoy.state(),
                state.store.clone(),
                state.contacts.load().map(|c| c.len()).unwrap_or(0),
                serde_json::json!({
                    "pin": state.credentials.has_secret(LockMethod::Pin),
                    "password": state.credentials.has_secret(LockMethod::Password),
                }),
            )
        };
        let motion = motion.status().await.map_err(failed("motion detector unavailable"))?;
        let enrolled = store.list_enrollments(&config.owner).map(|v| v.len()).unwrap_or(0);

        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "owner": config.owner,
            "camera": config.camera_device,
            "enrolled": enrolled,
            "contacts": contacts,
            "motion": motion,
            "settings": settings,
            "decoy": decoy,
            "secrets": secrets,
        }))
    }

    /// Arm the motion detector. False if it was already armed.
    async fn arm_motion(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        self.authorize_caller(None, &header, conn).await?;
        let motion = self.state.lock().await.motion.clone();
        motion.start().await.map_err(failed("failed to arm motion detector"))
    }

    /// Disarm the motion detector. True if a playing alert was silenced.
    async fn disarm_motion(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        self.authorize_caller(None, &header, conn).await?;
        let motion = self.state.lock().await.motion.clone();
        motion.stop().await.map_err(failed("failed to disarm motion detector"))
    }

    /// Run a power menu action ("power-off", "restart", "lock"), reporting the final state as JSON.
    async fn power_action(&self, action: &str) -> zbus::fdo::Result<String> {
        let action: PowerAction = action.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        tracing::info!(?action, "power action requested");
        let decoy = self.state.lock().await.decoy.clone();
        let outcome = decoy
            .power_action(action)
            .await
            .map_err(failed("power action failed"))?;
        to_json(&outcome)
    }

    /// Report one power button press. True when it opened the power menu.
    async fn power_button(&self) -> zbus::fdo::Result<bool> {
        let mut state = self.state.lock().await;
        let opened = state.power_button.press(Instant::now());
        if opened {
            state.decoy.show_power_menu();
        }
        Ok(opened)
    }

    async fn set_sound_alert(
        &self,
        enabled: bool,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        self.authorize_caller(None, &header, conn).await?;
        let motion = {
            let mut state = self.state.lock().await;
            state
                .settings
                .set_sound_alert_enabled(enabled)
                .map_err(failed("failed to save settings"))?;
            state.motion.clone()
        };
        motion
            .set_sound_alert_enabled(enabled)
            .await
            .map_err(failed("motion detector unavailable"))
    }

    async fn set_stealth_mode(
        &self,
        enabled: bool,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        self.authorize_caller(None, &header, conn).await?;
        tracing::info!(enabled, "stealth mode changed");
        self.state
            .lock()
            .await
            .settings
            .set_stealth_mode(enabled)
            .map_err(failed("failed to save settings"))
    }

    /// Check an unlock attempt. `secret` is ignored for the face method.
    ///
    /// Rejected attempts count toward a per-method lockout. A face attempt
    /// that never saw a face is not counted.
    async fn unlock(
        &self,
        method: &str,
        secret: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        let method = parse_method(method)?;
        if method == LockMethod::Fingerprint {
            return Err(zbus::fdo::Error::NotSupported(
                "fingerprint verdicts come from the platform reader".into(),
            ));
        }
        self.authorize_caller(None, &header, conn).await?;
        admit_attempt(&mut self.state.lock().await.unlock_attempts, method, Instant::now())?;

        let accepted = if method.is_secret() {
            let state = self.state.lock().await;
            let gate = Gatekeeper::new(&state.credentials, &[]);
            gate.verify(method, Credential::Secret(secret))
        } else {
            let (engine, store, owner, timeout) = {
                let state = self.state.lock().await;
                (
                    state.engine.clone(),
                    state.store.clone(),
                    state.config.owner.clone(),
                    state.config.verify_timeout(),
                )
            };
            let gallery = store.gallery(&owner).map_err(failed("failed to read enrollments"))?;
            let outcome = engine
                .verify(gallery.clone(), timeout)
                .await
                .map_err(failed("verification failed"))?;
            let Some(candidate) = outcome.candidate() else {
                tracing::info!("face unlock: no face detected");
                return Ok(false);
            };
            let state = self.state.lock().await;
            let gate = Gatekeeper::new(&state.credentials, &gallery);
            gate.verify(method, Credential::Face(candidate))
        };

        record_attempt(
            &mut self.state.lock().await.unlock_attempts,
            method,
            accepted,
            Instant::now(),
        );
        tracing::info!(method = %method, accepted, "unlock attempt");
        Ok(accepted)
    }

    /// Store a new PIN or password. `current` must match the one being replaced.
    async fn set_secret(
        &self,
        method: &str,
        current: &str,
        secret: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        let method = parse_method(method)?;
        self.authorize_caller(None, &header, conn).await?;
        let mut state = self.state.lock().await;
        let AppState {
            credentials,
            unlock_attempts,
            ..
        } = &mut *state;
        replace_secret(credentials, unlock_attempts, method, current, secret, Instant::now())
    }

    async fn add_contact(
        &self,
        name: &str,
        recipient: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        self.authorize_caller(None, &header, conn).await?;
        self.state
            .lock()
            .await
            .contacts
            .add(name, recipient)
            .map_err(failed("failed to add contact"))
    }

    /// Emergency contacts as JSON.
    async fn list_contacts(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize_caller(None, &header, conn).await?;
        let contacts = self
            .state
            .lock()
            .await
            .contacts
            .load()
            .map_err(failed("failed to read contacts"))?;
        to_json(&contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::{LOCKOUT, MAX_FAILURES};
    use crate::testutil::scratch_dir;

    fn credentials() -> CredentialStore {
        CredentialStore::load(scratch_dir("dbus").join("credentials.toml")).unwrap()
    }

    #[test]
    fn test_repeated_wrong_unlocks_lock_the_method_out() {
        let now = Instant::now();
        let mut limiter = RateLimiter::default();
        for _ in 0..MAX_FAILURES {
            admit_attempt(&mut limiter, LockMethod::Pin, now).unwrap();
            record_attempt(&mut limiter, LockMethod::Pin, false, now);
        }
        let err = admit_attempt(&mut limiter, LockMethod::Pin, now).unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::LimitsExceeded(_)));
        // Other methods keep working, and the lockout ends.
        admit_attempt(&mut limiter, LockMethod::Password, now).unwrap();
        admit_attempt(&mut limiter, LockMethod::Pin, now + LOCKOUT).unwrap();
    }

    #[test]
    fn test_accepted_unlock_resets_failures() {
        let now = Instant::now();
        let mut limiter = RateLimiter::default();
        for _ in 0..MAX_FAILURES - 1 {
            record_attempt(&mut limiter, LockMethod::Face, false, now);
        }
        record_attempt(&mut limiter, LockMethod::Face, true, now);
        record_attempt(&mut limiter, LockMethod::Face, false, now);
        admit_attempt(&mut limiter, LockMethod::Face, now).unwrap();
    }

    #[test]
    fn test_first_secret_needs_no_current() {
        let mut creds = credentials();
        let mut limiter = RateLimiter::default();
        replace_secret(&mut creds, &mut limiter, LockMethod::Pin, "", "1234", Instant::now()).unwrap();
        assert!(creds.verify_secret(LockMethod::Pin, "1234"));
    }

    #[test]
    fn test_secret_change_requires_current() {
        let now = Instant::now();
        let mut creds = credentials();
        let mut limiter = RateLimiter::default();
        replace_secret(&mut creds, &mut limiter, LockMethod::Pin, "", "1234", now).unwrap();

        let err = replace_secret(&mut creds, &mut limiter, LockMethod::Pin, "0000", "9999", now).unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::AccessDenied(_)));
        assert!(creds.verify_secret(LockMethod::Pin, "1234"));

        replace_secret(&mut creds, &mut limiter, LockMethod::Pin, "1234", "9999", now).unwrap();
        assert!(creds.verify_secret(LockMethod::Pin, "9999"));
    }

    #[test]
    fn test_guessing_the_current_secret_is_rate_limited() {
        let now = Instant::now();
        let mut creds = credentials();
        let mut limiter = RateLimiter::default();
        replace_secret(&mut creds, &mut limiter, LockMethod::Pin, "", "1234", now).unwrap();
        for guess in 0..MAX_FAILURES {
            let guess = format!("{guess:04}");
            assert!(replace_secret(&mut creds, &mut limiter, LockMethod::Pin, &guess, "9999", now).is_err());
        }
        // Even the right secret is refused during the lockout.
        let err = replace_secret(&mut creds, &mut limiter, LockMethod::Pin, "1234", "9999", now).unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::LimitsExceeded(_)));
        assert!(creds.verify_secret(LockMethod::Pin, "1234"));
    }
}
