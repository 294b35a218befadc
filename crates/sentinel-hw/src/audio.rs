//! Alarm playback through an external audio player (`paplay`, `aplay`, ...).

use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("player command is empty")]
    EmptyCommand,
    #[error("failed to start player `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn playback watcher: {0}")]
    Watcher(std::io::Error),
}

/// Plays the audible alarm.
///
/// `on_finish` runs once when playback ends on its own. It does not run
/// after `stop`.
pub trait AlertPlayer: Send {
    fn play(&mut self, on_finish: Box<dyn FnOnce() + Send>) -> Result<(), AudioError>;
    fn stop(&mut self);
    fn is_playing(&self) -> bool;
}

struct Playback {
    child: Arc<Mutex<Child>>,
    cancelled: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

/// Runs a player command once per alert, e.g. `paplay /usr/share/sentinel/alarm.oga`.
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
    current: Option<Playback>,
}

impl CommandPlayer {
    pub fn new(command_line: &str) -> Result<Self, AudioError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(AudioError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            current: None,
        })
    }
}

impl AlertPlayer for CommandPlayer {
    fn play(&mut self, on_finish: Box<dyn FnOnce() + Send>) -> Result<(), AudioError> {
        // One alarm at a time.
        self.stop();

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| AudioError::Spawn {
                command: self.program.clone(),
                source,
            })?;
        tracing::debug!(pid = child.id(), "alarm playback started");

        let child = Arc::new(Mutex::new(child));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (watch_child, watch_cancelled) = (child.clone(), cancelled.clone());

        let watcher = std::thread::Builder::new()
            .name("sentinel-alarm".into())
            .spawn(move || {
                loop {
                    let exited = {
                        let mut guard = watch_child.lock().unwrap_or_else(|e| e.into_inner());
                        !matches!(guard.try_wait(), Ok(None))
                    };
                    if exited || watch_cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                if !watch_cancelled.load(Ordering::Acquire) {
                    on_finish();
                }
            })
            .map_err(AudioError::Watcher)?;

        self.current = Some(Playback {
            child,
            cancelled,
            watcher: Some(watcher),
        });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut playback) = self.current.take() else {
            return;
        };
        playback.cancelled.store(true, Ordering::Release);
        {
            let mut child = playback.child.lock().unwrap_or_else(|e| e.into_inner());
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
                tracing::debug!("alarm playback stopped");
            }
            let _ = child.wait();
        }
        if let Some(watcher) = playback.watcher.take() {
            let _ = watcher.join();
        }
    }

    fn is_playing(&self) -> bool {
        self.current.as_ref().is_some_and(|p| {
            let mut child = p.child.lock().unwrap_or_else(|e| e.into_inner());
            matches!(child.try_wait(), Ok(None))
        })
    }
}

impl Drop for CommandPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
