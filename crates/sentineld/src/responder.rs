//! Intrusion responder: keep the intruder's photo and send it out.

use crate::engine::CapturedFrame;
use crate::messaging::{self, AlertEvent, Attachment, MessageSink};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

pub const INTRUSION_CAPTION: &str = "🚨 Unauthorized Access Detected! 🚨\nCheck the attached image.";

#[derive(Error, Debug)]
pub enum ResponderError {
    #[error("failed to encode intruder image: {0}")]
    Encode(#[from] sentinel_hw::FrameError),
    #[error("failed to save intruder image: {0}")]
    Io(#[from] std::io::Error),
}

/// What `respond` managed to do.
pub struct Response {
    pub saved: Option<PathBuf>,
    /// Background delivery task, if one was started.
    pub dispatch: Option<JoinHandle<usize>>,
}

pub struct IntrusionResponder {
    intruder_dir: PathBuf,
    sink: Arc<dyn MessageSink>,
    recipients: Vec<String>,
    counter: AtomicU64,
}

impl IntrusionResponder {
    pub fn new(intruder_dir: impl Into<PathBuf>, sink: Arc<dyn MessageSink>, recipients: Vec<String>) -> Self {
        Self {
            intruder_dir: intruder_dir.into(),
            sink,
            recipients,
            counter: AtomicU64::new(0),
        }
    }

    pub fn intruder_dir(&self) -> &Path {
        &self.intruder_dir
    }

    fn encode(capture: &CapturedFrame) -> Result<Vec<u8>, ResponderError> {
        Ok(capture.frame.encode_jpeg(capture.face.as_ref())?)
    }

    fn next_file_name(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("face_{}_{n}.jpg", chrono::Local::now().format("%Y%m%d_%H%M%S"))
    }

    fn save(&self, file_name: &str, jpeg: &[u8]) -> Result<PathBuf, ResponderError> {
        std::fs::create_dir_all(&self.intruder_dir)?;
        let path = self.intruder_dir.join(file_name);
        std::fs::write(&path, jpeg)?;
        tracing::info!(path = %path.display(), bytes = jpeg.len(), "intruder image saved");
        Ok(path)
    }

    fn spawn_dispatch(&self, file_name: String, jpeg: Vec<u8>) -> Option<JoinHandle<usize>> {
        if self.recipients.is_empty() {
            tracing::warn!("no intruder alert recipients configured");
            return None;
        }
        let event = AlertEvent {
            message: INTRUSION_CAPTION.to_string(),
            attachment: Some(Attachment { file_name, jpeg }),
            recipients: self.recipients.clone(),
        };
        let sink = self.sink.clone();
        Some(tokio::spawn(async move {
            messaging::deliver(sink.as_ref(), &event).await
        }))
    }

    /// Persist the captured frame under the intruder directory.
    pub fn record_intrusion(&self, capture: &CapturedFrame) -> Result<PathBuf, ResponderError> {
        let jpeg = Self::encode(capture)?;
        self.save(&self.next_file_name(), &jpeg)
    }

    /// Send the captured frame to the configured recipients in the background.
    pub fn dispatch_alert(&self, capture: &CapturedFrame) -> Option<JoinHandle<usize>> {
        match Self::encode(capture) {
            Ok(jpeg) => self.spawn_dispatch(self.next_file_name(), jpeg),
            Err(e) => {
                tracing::warn!(error = %e, "intruder alert not sent");
                None
            }
        }
    }

    /// Record, then dispatch. A failure in one does not prevent the other.
    pub fn respond(&self, capture: &CapturedFrame) -> Response {
        let jpeg = match Self::encode(capture) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(error = %e, "intruder image could not be encoded");
                return Response {
                    saved: None,
                    dispatch: None,
                };
            }
        };
        let file_name = self.next_file_name();
        let saved = self
            .save(&file_name, &jpeg)
            .map_err(|e| tracing::warn!(error = %e, "intruder image not saved"))
            .ok();
        let dispatch = self.spawn_dispatch(file_name, jpeg);
        Response { saved, dispatch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::testing::RecordingSink;
    use crate::testutil::scratch_dir;
    use image::RgbImage;
    use sentinel_core::BoundingBox;
    use sentinel_hw::Frame;

    fn capture() -> CapturedFrame {
        CapturedFrame {
            frame: Frame::new(RgbImage::from_pixel(64, 48, image::Rgb([120, 130, 140])), 7),
            face: Some(BoundingBox { x: 8.0, y: 4.0, width: 32.0, height: 24.0 }),
        }
    }

    #[tokio::test]
    async fn test_respond_saves_cropped_face_and_dispatches() {
        let dir = scratch_dir("responder");
        let sink = Arc::new(RecordingSink::default());
        let responder = IntrusionResponder::new(dir.join("intruders"), sink.clone(), vec!["42".into()]);

        let response = responder.respond(&capture());
        let path = response.saved.unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("face_") && name.ends_with("_0.jpg"), "{name}");
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (32, 24));

        assert_eq!(response.dispatch.unwrap().await.unwrap(), 1);
        let sent = sink.sent();
        assert_eq!(sent[0].recipient, "42");
        assert_eq!(sent[0].text, INTRUSION_CAPTION);
        assert!(sent[0].attachment_len.unwrap() > 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_save_failure_does_not_block_dispatch() {
        let dir = scratch_dir("responder");
        // A regular file where the directory should be.
        let blocked = dir.join("intruders");
        std::fs::write(&blocked, b"").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let responder = IntrusionResponder::new(&blocked, sink.clone(), vec!["42".into()]);

        let response = responder.respond(&capture());
        assert!(response.saved.is_none());
        assert_eq!(response.dispatch.unwrap().await.unwrap(), 1);
        assert!(responder.record_intrusion(&capture()).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let dir = scratch_dir("responder");
        let sink = Arc::new(RecordingSink {
            fail_for: Some("42".into()),
            ..Default::default()
        });
        let responder = IntrusionResponder::new(dir.join("intruders"), sink, vec!["42".into()]);
        let handle = responder.dispatch_alert(&capture()).unwrap();
        assert_eq!(handle.await.unwrap(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_no_recipients_still_records() {
        let dir = scratch_dir("responder");
        let responder =
            IntrusionResponder::new(dir.join("intruders"), Arc::new(RecordingSink::default()), vec![]);
        let response = responder.respond(&capture());
        assert!(response.saved.is_some());
        assert!(response.dispatch.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }
}
