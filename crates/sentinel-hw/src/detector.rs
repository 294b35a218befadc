//! Face detection through an external detector process.
//!
//! The detector model runs out of process. For every frame the daemon writes
//! a binary PGM image (`P5`) to the child's stdin and reads back exactly one
//! line of JSON: either an array of faces or an object with a `faces` array.
//! Each face carries a bounding box and named landmarks:
//!
//! ```json
//! {"faces": [{"bbox": {"x": 210, "y": 96, "width": 180, "height": 204},
//!             "confidence": 0.97,
//!             "landmarks": {"left_eye": {"x": 260, "y": 160}, "...": {}}}]}
//! ```

use crate::frame::Frame;
use sentinel_core::DetectedFace;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector command is empty")]
    EmptyCommand,
    #[error("failed to start detector `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("detector I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("detector exited")]
    Exited,
    #[error("malformed detector output: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Finds faces in a frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DetectorReply {
    Wrapped { faces: Vec<DetectedFace> },
    Bare(Vec<DetectedFace>),
}

/// Parse one reply line from the detector.
pub fn parse_detections(line: &str) -> Result<Vec<DetectedFace>, DetectorError> {
    let reply: DetectorReply = serde_json::from_str(line.trim())?;
    Ok(match reply {
        DetectorReply::Wrapped { faces } => faces,
        DetectorReply::Bare(faces) => faces,
    })
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Long-lived detector child process, restarted lazily after a failure.
pub struct DetectorProcess {
    program: String,
    args: Vec<String>,
    running: Option<Running>,
}

impl DetectorProcess {
    /// Build from a whitespace-separated command line. The child starts on
    /// first use.
    pub fn new(command_line: &str) -> Result<Self, DetectorError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(DetectorError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            running: None,
        })
    }

    fn ensure_running(&mut self) -> Result<&mut Running, DetectorError> {
        if self.running.is_none() {
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|source| DetectorError::Spawn {
                    command: self.program.clone(),
                    source,
                })?;
            let stdin = child.stdin.take().ok_or(DetectorError::Exited)?;
            let stdout = child.stdout.take().ok_or(DetectorError::Exited)?;
            tracing::info!(command = %self.program, pid = child.id(), "face detector started");
            self.running = Some(Running {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            });
        }
        self.running.as_mut().ok_or(DetectorError::Exited)
    }

    fn exchange(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
        let luma = frame.luma();
        let running = self.ensure_running()?;

        write!(running.stdin, "P5\n{} {}\n255\n", luma.width(), luma.height())?;
        running.stdin.write_all(luma.as_raw())?;
        running.stdin.flush()?;

        let mut line = String::new();
        if running.stdout.read_line(&mut line)? == 0 {
            return Err(DetectorError::Exited);
        }
        parse_detections(&line)
    }

    fn shutdown(&mut self) {
        if let Some(mut running) = self.running.take() {
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
    }
}

impl FaceDetector for DetectorProcess {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
        let result = self.exchange(frame);
        if let Err(e) = &result {
            // Output framing is lost after any failure; start fresh next time.
            tracing::warn!(error = %e, "face detector failed; restarting on next frame");
            self.shutdown();
        }
        result
    }
}

impl Drop for DetectorProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}
