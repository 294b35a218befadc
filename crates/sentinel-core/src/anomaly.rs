//! Motion anomaly state machine.
//!
//! ```text
//! Stopped --start--> Armed --anomaly--> Alerting --playback done--> Armed
//!    ^                 |                    |
//!    +------stop-------+--------stop--------+
//! ```
//!
//! The machine is pure: the caller feeds samples with their timestamps and
//! reports when the audible alert finished. A [`Trigger`] is returned only if
//! the magnitude exceeds the sensor threshold, no alert is in flight, and the
//! cooldown since the previous alert has elapsed. At most one alert is in
//! flight at a time, whichever sensor raised it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Accelerometer magnitude (m/s²) above which handling is suspicious.
pub const ACCEL_THRESHOLD: f32 = 50.0;
/// Gyroscope magnitude (rad/s) above which rotation is suspicious.
pub const GYRO_THRESHOLD: f32 = 10.0;
/// Minimum time between two alerts.
pub const ALERT_COOLDOWN: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Accelerometer => f.write_str("accelerometer"),
            SensorKind::Gyroscope => f.write_str("gyroscope"),
        }
    }
}

/// One three-axis reading from a motion sensor.
#[derive(Debug, Clone, Copy)]
pub struct MotionSample {
    pub kind: SensorKind,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub at: Instant,
}

impl MotionSample {
    pub fn new(kind: SensorKind, [x, y, z]: [f32; 3], at: Instant) -> Self {
        Self { kind, x, y, z, at }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Thresholds and routing decisions for anomaly alerts.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyPolicy {
    pub accel_threshold: f32,
    pub gyro_threshold: f32,
    pub cooldown: Duration,
    /// Gyroscope anomalies only sound the local alert unless this is set.
    pub gyroscope_notifies_contacts: bool,
}

impl Default for AnomalyPolicy {
    fn default() -> Self {
        Self {
            accel_threshold: ACCEL_THRESHOLD,
            gyro_threshold: GYRO_THRESHOLD,
            cooldown: ALERT_COOLDOWN,
            gyroscope_notifies_contacts: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Stopped,
    Armed,
    Alerting,
}

#[derive(Debug, Clone, Default)]
struct CooldownState {
    last_alert_at: Option<Instant>,
    in_flight: bool,
    seq: u64,
}

/// An alert the caller must now carry out.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub source: SensorKind,
    pub magnitude: f32,
    /// Run the contact alerting path in addition to the audible alert.
    pub notify_contacts: bool,
    /// Identifies this alert when reporting playback completion.
    pub seq: u64,
}

pub struct AnomalyDetector {
    policy: AnomalyPolicy,
    state: DetectorState,
    cooldown: CooldownState,
    sound_alert_enabled: bool,
}

impl AnomalyDetector {
    pub fn new(policy: AnomalyPolicy, sound_alert_enabled: bool) -> Self {
        Self {
            policy,
            state: DetectorState::Stopped,
            cooldown: CooldownState::default(),
            sound_alert_enabled,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn policy(&self) -> &AnomalyPolicy {
        &self.policy
    }

    pub fn sound_alert_enabled(&self) -> bool {
        self.sound_alert_enabled
    }

    pub fn alert_in_flight(&self) -> bool {
        self.cooldown.in_flight
    }

    /// Arm the detector. Returns false if it was already running.
    pub fn start(&mut self) -> bool {
        if self.state != DetectorState::Stopped {
            return false;
        }
        self.state = DetectorState::Armed;
        true
    }

    /// Disarm. Returns true if an alert was in flight and must be silenced.
    pub fn stop(&mut self) -> bool {
        let was_in_flight = self.cooldown.in_flight;
        self.cooldown.in_flight = false;
        self.state = DetectorState::Stopped;
        was_in_flight
    }

    /// Evaluate one sample.
    pub fn on_sample(&mut self, sample: &MotionSample) -> Option<Trigger> {
        if self.state == DetectorState::Stopped || !self.sound_alert_enabled {
            return None;
        }

        let threshold = match sample.kind {
            SensorKind::Accelerometer => self.policy.accel_threshold,
            SensorKind::Gyroscope => self.policy.gyro_threshold,
        };
        let magnitude = sample.magnitude();
        if magnitude.is_nan() || magnitude <= threshold || self.cooldown.in_flight {
            return None;
        }
        if let Some(last) = self.cooldown.last_alert_at {
            if sample.at.saturating_duration_since(last) < self.policy.cooldown {
                return None;
            }
        }

        self.cooldown.last_alert_at = Some(sample.at);
        self.cooldown.in_flight = true;
        self.cooldown.seq += 1;
        self.state = DetectorState::Alerting;

        let notify_contacts = match sample.kind {
            SensorKind::Accelerometer => true,
            SensorKind::Gyroscope => self.policy.gyroscope_notifies_contacts,
        };

        Some(Trigger {
            source: sample.kind,
            magnitude,
            notify_contacts,
            seq: self.cooldown.seq,
        })
    }

    /// Report that the audible alert `seq` finished. Stale reports are ignored.
    pub fn alert_finished(&mut self, seq: u64) -> bool {
        if !self.cooldown.in_flight || seq != self.cooldown.seq {
            return false;
        }
        self.cooldown.in_flight = false;
        if self.state == DetectorState::Alerting {
            self.state = DetectorState::Armed;
        }
        true
    }

    /// Toggle sound alerts. Returns true if an in-flight alert must be silenced.
    pub fn set_sound_alert_enabled(&mut self, enabled: bool) -> bool {
        self.sound_alert_enabled = enabled;
        if enabled || !self.cooldown.in_flight {
            return false;
        }
        self.cooldown.in_flight = false;
        if self.state == DetectorState::Alerting {
            self.state = DetectorState::Armed;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed() -> AnomalyDetector {
        let mut d = AnomalyDetector::new(AnomalyPolicy::default(), true);
        d.start();
        d
    }

    fn accel(mag: f32, at: Instant) -> MotionSample {
        MotionSample::new(SensorKind::Accelerometer, [mag, 0.0, 0.0], at)
    }

    fn gyro(mag: f32, at: Instant) -> MotionSample {
        MotionSample::new(SensorKind::Gyroscope, [0.0, mag, 0.0], at)
    }

    #[test]
    fn test_magnitude() {
        let s = MotionSample::new(SensorKind::Accelerometer, [3.0, 4.0, 12.0], Instant::now());
        assert!((s.magnitude() - 13.0).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold_ignored() {
        let mut d = armed();
        let t0 = Instant::now();
        assert!(d.on_sample(&accel(50.0, t0)).is_none());
        assert!(d.on_sample(&gyro(10.0, t0)).is_none());
        assert_eq!(d.state(), DetectorState::Armed);
    }

    #[test]
    fn test_stopped_ignores_samples() {
        let mut d = AnomalyDetector::new(AnomalyPolicy::default(), true);
        assert!(d.on_sample(&accel(80.0, Instant::now())).is_none());
    }

    #[test]
    fn test_sound_disabled_ignores_samples() {
        let mut d = AnomalyDetector::new(AnomalyPolicy::default(), false);
        d.start();
        assert!(d.on_sample(&accel(80.0, Instant::now())).is_none());
    }

    #[test]
    fn test_accelerometer_notifies_contacts() {
        let mut d = armed();
        let t = d.on_sample(&accel(60.0, Instant::now())).unwrap();
        assert_eq!(t.source, SensorKind::Accelerometer);
        assert!(t.notify_contacts);
        assert_eq!(d.state(), DetectorState::Alerting);
    }

    #[test]
    fn test_gyroscope_local_alert_only_by_default() {
        let mut d = armed();
        let t = d.on_sample(&gyro(12.0, Instant::now())).unwrap();
        assert!(!t.notify_contacts);

        let policy = AnomalyPolicy {
            gyroscope_notifies_contacts: true,
            ..AnomalyPolicy::default()
        };
        let mut d = AnomalyDetector::new(policy, true);
        d.start();
        assert!(d.on_sample(&gyro(12.0, Instant::now())).unwrap().notify_contacts);
    }

    #[test]
    fn test_cooldown_blocks_second_alert_within_window() {
        let mut d = armed();
        let t0 = Instant::now();
        let first = d.on_sample(&accel(60.0, t0)).unwrap();
        assert!(d.alert_finished(first.seq));
        assert!(d.on_sample(&accel(60.0, t0 + Duration::from_millis(4999))).is_none());
    }

    #[test]
    fn test_cooldown_allows_alert_after_window() {
        let mut d = armed();
        let t0 = Instant::now();
        let first = d.on_sample(&accel(60.0, t0)).unwrap();
        d.alert_finished(first.seq);
        let second = d.on_sample(&accel(60.0, t0 + Duration::from_millis(5000)));
        assert!(second.is_some());
    }

    #[test]
    fn test_in_flight_blocks_any_sensor() {
        let mut d = armed();
        let t0 = Instant::now();
        d.on_sample(&accel(60.0, t0)).unwrap();
        let later = t0 + Duration::from_secs(30);
        assert!(d.on_sample(&accel(90.0, later)).is_none());
        assert!(d.on_sample(&gyro(20.0, later)).is_none());
        assert!(d.alert_in_flight());
    }

    #[test]
    fn test_stale_finish_is_ignored() {
        let mut d = armed();
        let t0 = Instant::now();
        let first = d.on_sample(&accel(60.0, t0)).unwrap();
        assert!(!d.alert_finished(first.seq + 7));
        assert!(d.alert_in_flight());
        assert!(d.alert_finished(first.seq));
        assert!(!d.alert_finished(first.seq));
        assert_eq!(d.state(), DetectorState::Armed);
    }

    #[test]
    fn test_stop_reports_in_flight_and_is_idempotent() {
        let mut d = armed();
        d.on_sample(&accel(60.0, Instant::now())).unwrap();
        assert!(d.stop());
        assert_eq!(d.state(), DetectorState::Stopped);
        assert!(!d.stop());

        let mut never_started = AnomalyDetector::new(AnomalyPolicy::default(), true);
        assert!(!never_started.stop());
    }

    #[test]
    fn test_start_twice() {
        let mut d = armed();
        assert!(!d.start());
    }

    #[test]
    fn test_disable_sound_silences_in_flight() {
        let mut d = armed();
        let t0 = Instant::now();
        d.on_sample(&accel(60.0, t0)).unwrap();
        assert!(d.set_sound_alert_enabled(false));
        assert_eq!(d.state(), DetectorState::Armed);
        assert!(!d.set_sound_alert_enabled(true));
        // Cooldown still applies after re-enabling.
        assert!(d.on_sample(&accel(60.0, t0 + Duration::from_secs(1))).is_none());
        assert!(d.on_sample(&accel(60.0, t0 + Duration::from_secs(6))).is_some());
    }
}
