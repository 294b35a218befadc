//! Motion sensors read through the Linux IIO sysfs interface.
//!
//! Accelerometers expose `in_accel_{x,y,z}_raw`, gyroscopes
//! `in_anglvel_{x,y,z}_raw`. A shared `in_<type>_scale` (or one per axis)
//! converts raw counts into m/s² and rad/s.

use sentinel_core::{MotionSample, SensorKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default IIO device root.
pub const IIO_ROOT: &str = "/sys/bus/iio/devices";

/// Polling period, close to the platform's "UI" sensor rate.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(60);

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("no {0} found")]
    NotFound(SensorKind),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unparseable value in {path}: {value:?}")]
    Parse { path: PathBuf, value: String },
    #[error("failed to spawn sensor thread: {0}")]
    Spawn(std::io::Error),
}

/// A three-axis motion sensor.
pub trait MotionSensor: Send {
    fn kind(&self) -> SensorKind;
    fn read(&mut self) -> Result<[f32; 3], SensorError>;
}

fn channel_prefix(kind: SensorKind) -> &'static str {
    match kind {
        SensorKind::Accelerometer => "in_accel",
        SensorKind::Gyroscope => "in_anglvel",
    }
}

fn read_f32(path: &Path) -> Result<f32, SensorError> {
    let raw = fs::read_to_string(path).map_err(|source| SensorError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value = raw.trim();
    value.parse::<f32>().map_err(|_| SensorError::Parse {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}

/// One IIO device channel group.
#[derive(Debug)]
pub struct IioSensor {
    kind: SensorKind,
    device_dir: PathBuf,
    raw: [PathBuf; 3],
    scale: [f32; 3],
}

impl IioSensor {
    /// First device under [`IIO_ROOT`] that exposes `kind`.
    pub fn discover(kind: SensorKind) -> Result<Self, SensorError> {
        Self::discover_in(Path::new(IIO_ROOT), kind)
    }

    pub fn discover_in(root: &Path, kind: SensorKind) -> Result<Self, SensorError> {
        let entries = fs::read_dir(root).map_err(|_| SensorError::NotFound(kind))?;
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("iio:device"))
            })
            .collect();
        dirs.sort();

        for dir in dirs {
            match Self::open(&dir, kind) {
                Ok(sensor) => return Ok(sensor),
                Err(SensorError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::debug!(device = %dir.display(), error = %e, "skipping IIO device");
                }
            }
        }
        Err(SensorError::NotFound(kind))
    }

    /// Open `kind` channels on a specific IIO device directory.
    pub fn open(device_dir: &Path, kind: SensorKind) -> Result<Self, SensorError> {
        let prefix = channel_prefix(kind);
        let raw = ["x", "y", "z"].map(|axis| device_dir.join(format!("{prefix}_{axis}_raw")));
        if !raw.iter().all(|p| p.exists()) {
            return Err(SensorError::NotFound(kind));
        }

        let shared = device_dir.join(format!("{prefix}_scale"));
        let shared_scale = if shared.exists() { Some(read_f32(&shared)?) } else { None };
        let mut scale = [1.0; 3];
        for (slot, axis) in scale.iter_mut().zip(["x", "y", "z"]) {
            let per_axis = device_dir.join(format!("{prefix}_{axis}_scale"));
            *slot = if per_axis.exists() {
                read_f32(&per_axis)?
            } else {
                shared_scale.unwrap_or(1.0)
            };
        }

        tracing::info!(device = %device_dir.display(), sensor = %kind, ?scale, "motion sensor found");
        Ok(Self {
            kind,
            device_dir: device_dir.to_path_buf(),
            raw,
            scale,
        })
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }
}

impl MotionSensor for IioSensor {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn read(&mut self) -> Result<[f32; 3], SensorError> {
        let mut out = [0.0; 3];
        for ((slot, path), scale) in out.iter_mut().zip(&self.raw).zip(self.scale) {
            *slot = read_f32(path)? * scale;
        }
        Ok(out)
    }
}

/// A running sensor polling thread. Polling stops when this is dropped.
pub struct SensorSubscription {
    kind: SensorKind,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SensorSubscription {
    /// Poll `sensor` every `interval` and forward samples to `tx`.
    ///
    /// Samples are dropped when the receiver is behind. The thread exits
    /// when the receiver closes or the subscription is stopped.
    pub fn spawn(
        mut sensor: Box<dyn MotionSensor>,
        interval: Duration,
        tx: mpsc::Sender<MotionSample>,
    ) -> Result<Self, SensorError> {
        let kind = sensor.kind();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let name = match kind {
            SensorKind::Accelerometer => "sentinel-accel",
            SensorKind::Gyroscope => "sentinel-gyro",
        };

        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut failing = false;
                while !thread_stop.load(Ordering::Relaxed) {
                    match sensor.read() {
                        Ok(values) => {
                            failing = false;
                            let sample = MotionSample::new(kind, values, Instant::now());
                            match tx.try_send(sample) {
                                Ok(()) | Err(TrySendError::Full(_)) => {}
                                Err(TrySendError::Closed(_)) => break,
                            }
                        }
                        Err(e) => {
                            if !failing {
                                tracing::warn!(sensor = %kind, error = %e, "sensor read failed");
                                failing = true;
                            }
                        }
                    }
                    std::thread::sleep(interval);
                }
                tracing::debug!(sensor = %kind, "sensor polling stopped");
            })
            .map_err(SensorError::Spawn)?;

        Ok(Self {
            kind,
            stop,
            handle: Some(handle),
        })
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Stop polling and join the thread. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SensorSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
