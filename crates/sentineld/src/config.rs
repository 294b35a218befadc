use sentinel_core::anomaly::{ACCEL_THRESHOLD, ALERT_COOLDOWN, GYRO_THRESHOLD};
use sentinel_core::guide::DEFAULT_DWELL;
use sentinel_core::{AnomalyPolicy, GuideRegion};
use sentinel_hw::sensors::DEFAULT_SAMPLE_INTERVAL;

use crate::alerting::DELIVERY_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0, the front camera).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Face detector command line; fed PGM frames on stdin.
    pub detector_command: String,
    /// Root of all persisted state (faces, intruders, settings, contacts).
    pub data_dir: PathBuf,
    /// Owner whose gallery guards the power menu and unlock.
    pub owner: String,
    /// Timeout in seconds for a verify operation.
    pub verify_timeout_secs: u64,
    /// Timeout in seconds for an enroll operation.
    pub enroll_timeout_secs: u64,
    /// Continuous time a face must stay inside the guide region to enroll.
    pub dwell_ms: u64,
    /// Fixed guide ellipse; centred on the frame when unset.
    pub guide_region: Option<GuideRegion>,
    pub accel_threshold: f32,
    pub gyro_threshold: f32,
    pub alert_cooldown_ms: u64,
    pub gyro_notifies_contacts: bool,
    pub sensor_interval_ms: u64,
    /// Alarm player command line.
    pub alarm_command: String,
    /// Show the decoy animation even when the owner is recognized.
    pub decoy_on_match: bool,
    /// Whether the daemon may lock sessions through logind.
    pub lock_sessions: bool,
    pub telegram_token: Option<String>,
    /// Telegram chat ids that receive intruder photos.
    pub intruder_chat_ids: Vec<String>,
    /// HTTP SMS gateway for emergency contact messages.
    pub sms_gateway_url: Option<String>,
    /// Bound on delivering one movement alert to all contacts.
    pub contact_timeout_secs: u64,
    /// Last-known location to report, as "lat,lon".
    pub fixed_location: Option<(f64, f64)>,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `SENTINEL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("SENTINEL_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("sentinel")
        });

        let env_f32 = |key: &str, default: f32| parsed(&var, key).unwrap_or(default);
        let env_u32 = |key: &str, default: u32| parsed(&var, key).unwrap_or(default);
        let env_u64 = |key: &str, default: u64| parsed(&var, key).unwrap_or(default);
        let env_bool = |key: &str, default: bool| {
            var(key)
                .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off" | ""))
                .unwrap_or(default)
        };

        Self {
            camera_device: var("SENTINEL_CAMERA_DEVICE")
                .unwrap_or_else(|| "/dev/video0".to_string()),
            camera_width: env_u32("SENTINEL_CAMERA_WIDTH", 640),
            camera_height: env_u32("SENTINEL_CAMERA_HEIGHT", 480),
            detector_command: var("SENTINEL_DETECTOR_COMMAND")
                .unwrap_or_else(|| "sentinel-face-detector".to_string()),
            data_dir,
            owner: var("SENTINEL_OWNER")
                .or_else(|| var("USER"))
                .unwrap_or_else(|| "owner".to_string()),
            verify_timeout_secs: env_u64("SENTINEL_VERIFY_TIMEOUT_SECS", 10),
            enroll_timeout_secs: env_u64("SENTINEL_ENROLL_TIMEOUT_SECS", 30),
            dwell_ms: env_u64("SENTINEL_DWELL_MS", DEFAULT_DWELL.as_millis() as u64),
            guide_region: var("SENTINEL_GUIDE_REGION").and_then(|v| parse_guide_region(&v)),
            accel_threshold: env_f32("SENTINEL_ACCEL_THRESHOLD", ACCEL_THRESHOLD),
            gyro_threshold: env_f32("SENTINEL_GYRO_THRESHOLD", GYRO_THRESHOLD),
            alert_cooldown_ms: env_u64(
                "SENTINEL_ALERT_COOLDOWN_MS",
                ALERT_COOLDOWN.as_millis() as u64,
            )
            .max(ALERT_COOLDOWN.as_millis() as u64),
            gyro_notifies_contacts: env_bool("SENTINEL_GYRO_NOTIFIES_CONTACTS", false),
            sensor_interval_ms: env_u64(
                "SENTINEL_SENSOR_INTERVAL_MS",
                DEFAULT_SAMPLE_INTERVAL.as_millis() as u64,
            ),
            alarm_command: var("SENTINEL_ALARM_COMMAND").unwrap_or_else(|| {
                "paplay /usr/share/sounds/freedesktop/stereo/alarm-clock-elapsed.oga".to_string()
            }),
            decoy_on_match: env_bool("SENTINEL_DECOY_ON_MATCH", false),
            lock_sessions: env_bool("SENTINEL_LOCK_SESSIONS", true),
            telegram_token: var("SENTINEL_TELEGRAM_TOKEN").filter(|t| !t.trim().is_empty()),
            intruder_chat_ids: var("SENTINEL_INTRUDER_CHAT_IDS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            sms_gateway_url: var("SENTINEL_SMS_GATEWAY_URL").filter(|u| !u.trim().is_empty()),
            contact_timeout_secs: env_u64(
                "SENTINEL_CONTACT_TIMEOUT_SECS",
                DELIVERY_TIMEOUT.as_secs(),
            )
            .max(1),
            fixed_location: var("SENTINEL_LOCATION").and_then(|v| parse_location(&v)),
            session_bus: env_bool("SENTINEL_SESSION_BUS", false),
        }
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.data_dir.join("faces")
    }

    pub fn intruders_dir(&self) -> PathBuf {
        self.data_dir.join("intruders")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.toml")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.toml")
    }

    pub fn contacts_path(&self) -> PathBuf {
        self.data_dir.join("contacts.txt")
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn enroll_timeout(&self) -> Duration {
        Duration::from_secs(self.enroll_timeout_secs)
    }

    pub fn contact_timeout(&self) -> Duration {
        Duration::from_secs(self.contact_timeout_secs)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_interval_ms.max(1))
    }

    pub fn anomaly_policy(&self) -> AnomalyPolicy {
        AnomalyPolicy {
            accel_threshold: self.accel_threshold,
            gyro_threshold: self.gyro_threshold,
            cooldown: Duration::from_millis(self.alert_cooldown_ms),
            gyroscope_notifies_contacts: self.gyro_notifies_contacts,
        }
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// "lat,lon" in degrees.
fn parse_location(value: &str) -> Option<(f64, f64)> {
    let (lat, lon) = value.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)).then_some((lat, lon))
}

/// "cx,cy,rx,ry" in pixels.
fn parse_guide_region(value: &str) -> Option<GuideRegion> {
    let parts: Vec<f32> = value
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    match parts[..] {
        [center_x, center_y, radius_x, radius_y] if radius_x > 0.0 && radius_y > 0.0 => {
            Some(GuideRegion {
                center_x,
                center_y,
                radius_x,
                radius_y,
            })
        }
        _ => None,
    }
}
