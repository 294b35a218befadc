use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use sentinel_hw::{Camera, CommandPlayer, DetectorProcess};

mod access;
mod alerting;
mod config;
mod contacts;
mod credentials;
mod dbus_interface;
mod decoy;
mod engine;
mod location;
mod messaging;
mod motion;
mod rate_limiter;
mod responder;
mod settings;
mod store;
#[cfg(test)]
mod testutil;

use alerting::ContactAlerter;
use config::Config;
use contacts::ContactsStore;
use credentials::CredentialStore;
use dbus_interface::{AppState, SentinelService, BUS_NAME, OBJECT_PATH};
use decoy::{DecoyController, DecoyTiming, EngineVerifier, PowerButtonWatch, SessionLocker};
use location::{FixedLocation, LocationProvider, NoLocation};
use messaging::{LogSink, MessageSink, TelegramSink, WebhookSink};
use motion::IioSensors;
use responder::IntrusionResponder;
use settings::SettingsStore;
use store::EnrollmentStore;

/// Intruder photos go to Telegram.
fn intrusion_sink(config: &Config) -> Arc<dyn MessageSink> {
    match &config.telegram_token {
        Some(token) => Arc::new(TelegramSink::new(token)),
        None => {
            tracing::warn!("SENTINEL_TELEGRAM_TOKEN not set; intruder alerts will only be logged");
            Arc::new(LogSink)
        }
    }
}

/// Emergency contacts are reached through the SMS gateway.
fn contact_sink(config: &Config) -> Arc<dyn MessageSink> {
    match &config.sms_gateway_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone())),
        None => {
            tracing::warn!("SENTINEL_SMS_GATEWAY_URL not set; contact alerts will only be logged");
            Arc::new(LogSink)
        }
    }
}

fn location_provider(config: &Config) -> Arc<dyn LocationProvider> {
    match config.fixed_location {
        Some((latitude, longitude)) => Arc::new(FixedLocation {
            latitude,
            longitude,
        }),
        None => Arc::new(NoLocation),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("sentineld starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        data_dir = %config.data_dir.display(),
        owner = %config.owner,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let settings = SettingsStore::load(config.settings_path())?;
    let credentials = CredentialStore::load(config.credentials_path())?;
    let store = Arc::new(EnrollmentStore::new(config.faces_dir()));

    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    let detector = DetectorProcess::new(&config.detector_command)
        .with_context(|| format!("failed to start detector '{}'", config.detector_command))?;
    let engine = engine::spawn_engine(Box::new(camera), Box::new(detector))?;
    tracing::info!("engine started");

    let alerter = ContactAlerter::new(
        ContactsStore::new(config.contacts_path()),
        location_provider(&config),
        contact_sink(&config),
    )
    .with_delivery_timeout(config.contact_timeout());
    let player = CommandPlayer::new(&config.alarm_command)?;
    let motion = motion::spawn_motion(
        config.anomaly_policy(),
        settings.get().sound_alert_enabled,
        Box::new(player),
        Arc::new(IioSensors),
        config.sensor_interval(),
        Arc::new(alerter),
    );

    let responder = Arc::new(IntrusionResponder::new(
        config.intruders_dir(),
        intrusion_sink(&config),
        config.intruder_chat_ids.clone(),
    ));
    let verifier = EngineVerifier {
        engine: engine.clone(),
        store: store.clone(),
        owner: config.owner.clone(),
        timeout: config.verify_timeout(),
    };
    let decoy = Arc::new(DecoyController::new(
        Arc::new(verifier),
        responder,
        Arc::new(SessionLocker::new(config.lock_sessions)),
        config.decoy_on_match,
        DecoyTiming::default(),
    ));

    let session_bus = config.session_bus;
    let state = AppState {
        contacts: ContactsStore::new(config.contacts_path()),
        config,
        engine,
        store,
        settings,
        credentials,
        motion: motion.clone(),
        decoy,
        power_button: PowerButtonWatch::default(),
        unlock_attempts: Default::default(),
    };
    let service = SentinelService {
        state: Arc::new(Mutex::new(state)),
    };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "sentineld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("sentineld shutting down");

    if let Err(e) = motion.stop().await {
        tracing::warn!(error = %e, "motion detector did not stop cleanly");
    }

    Ok(())
}
