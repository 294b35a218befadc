use sentinel_core::{
    extract_signature, BoundingBox, CosineMatcher, DetectedFace, DwellTracker, EnrollmentRecord,
    FaceSignature, GuideRegion, MatchResult, Matcher,
};
use sentinel_hw::{FaceDetector, Frame, FrameSource};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// How long the engine waits for a frame before re-checking cancellation.
const FRAME_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] sentinel_hw::CameraError),
    #[error("not all facial features detected")]
    IncompleteFace,
    #[error("no face held inside the guide region before the timeout")]
    Timeout,
    #[error("camera stream ended")]
    StreamEnded,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("capture thread panicked")]
    CapturePanicked,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// The frame a session resolved on, with the face it used.
#[derive(Clone)]
pub struct CapturedFrame {
    pub frame: Frame,
    pub face: Option<BoundingBox>,
}

/// Terminal state of a verification session.
pub enum VerifyOutcome {
    Matched {
        result: MatchResult,
        candidate: FaceSignature,
    },
    NotMatched {
        result: MatchResult,
        candidate: FaceSignature,
        capture: CapturedFrame,
    },
    /// No face within the timeout. Callers treat this as not matched.
    NoFaceDetected,
}

impl VerifyOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, VerifyOutcome::Matched { .. })
    }

    pub fn candidate(&self) -> Option<&FaceSignature> {
        match self {
            VerifyOutcome::Matched { candidate, .. } | VerifyOutcome::NotMatched { candidate, .. } => {
                Some(candidate)
            }
            VerifyOutcome::NoFaceDetected => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VerifyOutcome::Matched { .. } => "matched",
            VerifyOutcome::NotMatched { .. } => "not_matched",
            VerifyOutcome::NoFaceDetected => "no_face_detected",
        }
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        region: Option<GuideRegion>,
        dwell: Duration,
        reply: oneshot::Sender<Result<FaceSignature, EngineError>>,
    },
    Verify {
        gallery: Vec<EnrollmentRecord>,
        reply: oneshot::Sender<Result<VerifyOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request enrollment: wait for a face to dwell in the guide region, then
    /// extract its signature.
    pub async fn enroll(
        &self,
        region: Option<GuideRegion>,
        dwell: Duration,
        timeout: Duration,
    ) -> Result<FaceSignature, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                region,
                dwell,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed)?,
            Err(_) => Err(EngineError::Timeout),
        }
    }

    /// Request verification against `gallery`.
    ///
    /// Resolves `NoFaceDetected` when `timeout` elapses first. Dropping the
    /// reply receiver tells the engine to abandon the session.
    pub async fn verify(
        &self,
        gallery: Vec<EnrollmentRecord>,
        timeout: Duration,
    ) -> Result<VerifyOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify {
                gallery,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed)?,
            Err(_) => {
                tracing::info!(timeout_ms = timeout.as_millis() as u64, "verify: timed out without a face");
                Ok(VerifyOutcome::NoFaceDetected)
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread that owns the camera and detector.
pub fn spawn_engine(
    mut camera: Box<dyn FrameSource>,
    mut detector: Box<dyn FaceDetector>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("sentinel-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        region,
                        dwell,
                        reply,
                    } => {
                        let result = run_enroll(
                            camera.as_mut(),
                            detector.as_mut(),
                            region,
                            dwell,
                            &|| reply.is_closed(),
                        );
                        if reply.send(result).is_err() {
                            tracing::debug!("enroll: caller gone; result discarded");
                        }
                    }
                    EngineRequest::Verify { gallery, reply } => {
                        let result = run_verify(
                            camera.as_mut(),
                            detector.as_mut(),
                            &gallery,
                            &|| reply.is_closed(),
                        );
                        if reply.send(result).is_err() {
                            tracing::debug!("verify: caller gone; late result discarded");
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Single-slot handoff from the capture thread to the detector.
///
/// A frame is accepted only while the detector is waiting for one. Frames
/// arriving during detection are dropped, never queued.
#[derive(Default)]
struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    waiting: bool,
    closed: bool,
    dropped: u64,
}

enum Take {
    Frame(Frame),
    Empty,
    Closed,
}

impl FrameSlot {
    fn offer(&self, frame: Frame) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.waiting && state.frame.is_none() {
            state.frame = Some(frame);
            self.ready.notify_one();
        } else {
            state.dropped += 1;
        }
    }

    fn take(&self, timeout: Duration) -> Take {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting = true;
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.frame.is_none() && !s.closed)
            .unwrap_or_else(|e| e.into_inner());
        state.waiting = false;
        match state.frame.take() {
            Some(frame) => Take::Frame(frame),
            None if state.closed => Take::Closed,
            None => Take::Empty,
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        self.ready.notify_all();
    }

    fn dropped(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }
}

/// Stream frames on a capture thread and run detection on this one.
///
/// `on_faces` sees each analysed frame with its detections and breaks to end
/// the session. Detector errors count as "no face". Dark frames are skipped.
fn run_session(
    camera: &mut dyn FrameSource,
    detector: &mut dyn FaceDetector,
    cancelled: &dyn Fn() -> bool,
    on_faces: &mut dyn FnMut(&Frame, Vec<DetectedFace>) -> ControlFlow<()>,
) -> Result<(), EngineError> {
    let slot = FrameSlot::default();
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let capture = std::thread::Builder::new()
            .name("sentinel-capture".into())
            .spawn_scoped(scope, || {
                let result = camera.stream(&mut |frame: Frame| {
                    if stop.load(Ordering::Acquire) {
                        return ControlFlow::Break(());
                    }
                    slot.offer(frame);
                    ControlFlow::Continue(())
                });
                slot.close();
                result
            })
            .map_err(EngineError::Spawn)?;

        let mut analysed = 0u64;
        let mut ended_by_stream = false;
        while !cancelled() {
            let frame = match slot.take(FRAME_POLL) {
                Take::Frame(frame) => frame,
                Take::Empty => continue,
                Take::Closed => {
                    ended_by_stream = true;
                    break;
                }
            };
            if frame.is_dark {
                continue;
            }
            analysed += 1;
            let faces = detector.detect(&frame).unwrap_or_else(|e| {
                tracing::debug!(seq = frame.sequence, error = %e, "detection failed; treating as no face");
                Vec::new()
            });
            if on_faces(&frame, faces).is_break() {
                break;
            }
        }
        stop.store(true, Ordering::Release);

        let streamed = capture.join().map_err(|_| EngineError::CapturePanicked)?;
        tracing::debug!(analysed, dropped = slot.dropped(), "capture session finished");
        streamed?;
        if ended_by_stream {
            return Err(EngineError::StreamEnded);
        }
        Ok(())
    })
}

/// Single-shot verification: the first frame with a face decides.
fn run_verify(
    camera: &mut dyn FrameSource,
    detector: &mut dyn FaceDetector,
    gallery: &[EnrollmentRecord],
    cancelled: &dyn Fn() -> bool,
) -> Result<VerifyOutcome, EngineError> {
    let mut outcome = None;
    let session = run_session(camera, detector, cancelled, &mut |frame, faces| {
        let Some(face) = DetectedFace::most_prominent(&faces) else {
            return ControlFlow::Continue(());
        };
        let candidate = extract_signature(face);
        // An incomplete face cannot match anyone.
        let result = if candidate.is_valid() {
            CosineMatcher.compare(&candidate, gallery)
        } else {
            MatchResult::no_match()
        };
        tracing::info!(
            matched = result.matched,
            similarity = result.similarity,
            gallery = gallery.len(),
            complete = candidate.is_valid(),
            "verify: face captured"
        );
        outcome = Some(if result.matched {
            VerifyOutcome::Matched { result, candidate }
        } else {
            VerifyOutcome::NotMatched {
                result,
                candidate,
                capture: CapturedFrame {
                    frame: frame.clone(),
                    face: Some(face.bbox),
                },
            }
        });
        ControlFlow::Break(())
    });

    match (outcome, session) {
        (Some(outcome), _) => Ok(outcome),
        (None, Err(EngineError::StreamEnded)) | (None, Ok(())) => Ok(VerifyOutcome::NoFaceDetected),
        (None, Err(e)) => Err(e),
    }
}

/// Enrollment: wait for the most prominent face to dwell inside the guide
/// region, then extract its signature.
fn run_enroll(
    camera: &mut dyn FrameSource,
    detector: &mut dyn FaceDetector,
    region: Option<GuideRegion>,
    dwell: Duration,
    cancelled: &dyn Fn() -> bool,
) -> Result<FaceSignature, EngineError> {
    let mut tracker = DwellTracker::new(dwell);
    let mut result = None;
    let session = run_session(camera, detector, cancelled, &mut |frame, faces| {
        let region = region.unwrap_or_else(|| GuideRegion::centered(frame.width(), frame.height()));
        let face = DetectedFace::most_prominent(&faces);
        if !tracker.observe(&region, face.map(|f| f.bbox.center()), frame.timestamp) {
            return ControlFlow::Continue(());
        }
        let Some(face) = face else {
            return ControlFlow::Continue(());
        };
        let signature = extract_signature(face);
        result = Some(if signature.is_valid() {
            tracing::info!(confidence = face.confidence, "enroll: face captured");
            Ok(signature)
        } else {
            tracing::info!("enroll: face dwelled but landmarks incomplete");
            Err(EngineError::IncompleteFace)
        });
        ControlFlow::Break(())
    });

    match result {
        Some(result) => result,
        None => {
            session?;
            Err(EngineError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use sentinel_core::{Landmark, Point};
    use sentinel_hw::{CameraError, DetectorError};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Endless grey frames at ~200 fps, or `limit` frames then end of stream.
    struct FakeCamera {
        limit: Option<usize>,
        dark: bool,
    }

    impl FrameSource for FakeCamera {
        fn stream(&mut self, on_frame: &mut dyn FnMut(Frame) -> ControlFlow<()>) -> Result<(), CameraError> {
            let value = if self.dark { 0 } else { 128 };
            let mut seq = 0u32;
            loop {
                if self.limit.is_some_and(|limit| seq as usize >= limit) {
                    return Ok(());
                }
                let image = RgbImage::from_pixel(320, 240, image::Rgb([value, value, value]));
                if on_frame(Frame::new(image, seq)).is_break() {
                    return Ok(());
                }
                seq += 1;
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    struct BrokenCamera;

    impl FrameSource for BrokenCamera {
        fn stream(&mut self, _: &mut dyn FnMut(Frame) -> ControlFlow<()>) -> Result<(), CameraError> {
            Err(CameraError::DeviceBusy)
        }
    }

    /// Returns the same faces for every frame, counting calls.
    struct FakeDetector {
        faces: Vec<DetectedFace>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FakeDetector {
        fn new(faces: Vec<DetectedFace>) -> Self {
            Self {
                faces,
                calls: Arc::default(),
                fail: false,
            }
        }
    }

    impl FaceDetector for FakeDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DetectorError::Exited);
            }
            Ok(self.faces.clone())
        }
    }

    /// Complete face centred near the middle of a 320x240 frame.
    fn face(offset: f32, width: f32) -> DetectedFace {
        let landmarks: BTreeMap<Landmark, Point> = sentinel_core::signature::SIGNATURE_LANDMARKS
            .iter()
            .enumerate()
            .map(|(i, which)| {
                let p = Point {
                    x: 120.0 + i as f32 * 9.0 + offset,
                    y: 90.0 + (i % 3) as f32 * 11.0,
                };
                (*which, p)
            })
            .collect();
        DetectedFace {
            bbox: BoundingBox { x: 110.0, y: 60.0, width, height: 120.0 },
            confidence: 0.9,
            landmarks,
        }
    }

    fn record(signature: FaceSignature) -> EnrollmentRecord {
        EnrollmentRecord {
            id: "rec-1".into(),
            owner_id: "alice".into(),
            signature,
            created_at: String::new(),
        }
    }

    /// Unit vector on a single axis; far from any real face.
    fn stranger() -> FaceSignature {
        let mut values = vec!["0".to_string(); 16];
        values[1] = "1".into();
        FaceSignature::from_encoded(values.join(","))
    }

    fn engine(camera: impl FrameSource + 'static, detector: FakeDetector) -> EngineHandle {
        spawn_engine(Box::new(camera), Box::new(detector)).unwrap()
    }

    const LIVE: FakeCamera = FakeCamera { limit: None, dark: false };

    #[tokio::test]
    async fn test_verify_matches_enrolled_owner() {
        let owner = face(0.0, 100.0);
        let handle = engine(LIVE, FakeDetector::new(vec![owner.clone()]));
        let gallery = vec![record(extract_signature(&owner))];

        let outcome = handle.verify(gallery, Duration::from_secs(5)).await.unwrap();
        match outcome {
            VerifyOutcome::Matched { result, .. } => {
                assert!(result.similarity > 0.999);
                assert_eq!(result.record_id.as_deref(), Some("rec-1"));
            }
            other => panic!("expected match, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn test_verify_stranger_returns_frame() {
        let handle = engine(LIVE, FakeDetector::new(vec![face(0.0, 100.0)]));
        let outcome = handle
            .verify(vec![record(stranger())], Duration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            VerifyOutcome::NotMatched { result, capture, .. } => {
                assert!(!result.matched);
                assert!(result.similarity < 0.8);
                assert_eq!(capture.frame.width(), 320);
                assert_eq!(capture.face.map(|b| b.width), Some(100.0));
            }
            other => panic!("expected no match, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn test_verify_uses_most_prominent_face() {
        let owner = face(0.0, 100.0);
        let mut bystander = face(40.0, 60.0);
        bystander.bbox.height = 60.0;
        let handle = engine(LIVE, FakeDetector::new(vec![bystander, owner.clone()]));
        let outcome = handle
            .verify(vec![record(extract_signature(&owner))], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.is_match());
    }

    #[tokio::test]
    async fn test_incomplete_face_never_matches() {
        let mut partial = face(0.0, 100.0);
        partial.landmarks.remove(&Landmark::LeftCheek);
        let handle = engine(LIVE, FakeDetector::new(vec![partial]));
        let outcome = handle
            .verify(vec![record(extract_signature(&face(0.0, 100.0)))], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::NotMatched { .. }));
        assert!(outcome.candidate().is_some_and(|p| p.is_empty()));
    }

    #[tokio::test]
    async fn test_verify_times_out_then_engine_serves_next_request() {
        let detector = FakeDetector::new(Vec::new());
        let calls = detector.calls.clone();
        let handle = engine(LIVE, detector);

        let outcome = handle.verify(Vec::new(), Duration::from_millis(200)).await.unwrap();
        assert!(matches!(outcome, VerifyOutcome::NoFaceDetected));
        assert!(calls.load(Ordering::SeqCst) > 0);

        // The abandoned session must release the camera for the next request.
        let outcome = handle.verify(Vec::new(), Duration::from_millis(200)).await.unwrap();
        assert!(matches!(outcome, VerifyOutcome::NoFaceDetected));
    }

    #[tokio::test]
    async fn test_detector_errors_are_no_face() {
        let mut detector = FakeDetector::new(vec![face(0.0, 100.0)]);
        detector.fail = true;
        let handle = engine(FakeCamera { limit: Some(20), dark: false }, detector);
        let outcome = handle.verify(Vec::new(), Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, VerifyOutcome::NoFaceDetected));
    }

    #[tokio::test]
    async fn test_dark_frames_are_not_analysed() {
        let detector = FakeDetector::new(vec![face(0.0, 100.0)]);
        let calls = detector.calls.clone();
        let handle = engine(FakeCamera { limit: Some(10), dark: true }, detector);
        let outcome = handle.verify(Vec::new(), Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, VerifyOutcome::NoFaceDetected));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_camera_failure_is_reported() {
        let handle = engine(BrokenCamera, FakeDetector::new(Vec::new()));
        let err = handle.verify(Vec::new(), Duration::from_secs(5)).await;
        assert!(matches!(err, Err(EngineError::Camera(CameraError::DeviceBusy))));
    }

    #[tokio::test]
    async fn test_enroll_after_dwell() {
        let owner = face(0.0, 100.0);
        let handle = engine(LIVE, FakeDetector::new(vec![owner.clone()]));
        let signature = handle
            .enroll(None, Duration::from_millis(60), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(signature, extract_signature(&owner));
    }

    #[tokio::test]
    async fn test_enroll_outside_region_times_out() {
        let handle = engine(LIVE, FakeDetector::new(vec![face(0.0, 100.0)]));
        let far_corner = GuideRegion {
            center_x: 10.0,
            center_y: 10.0,
            radius_x: 5.0,
            radius_y: 5.0,
        };
        let err = handle
            .enroll(Some(far_corner), Duration::from_millis(30), Duration::from_millis(300))
            .await;
        assert!(matches!(err, Err(EngineError::Timeout)));
    }

    #[tokio::test]
    async fn test_enroll_incomplete_face() {
        let mut partial = face(0.0, 100.0);
        partial.landmarks.remove(&Landmark::NoseBase);
        let handle = engine(LIVE, FakeDetector::new(vec![partial]));
        let err = handle
            .enroll(None, Duration::from_millis(30), Duration::from_secs(5))
            .await;
        assert!(matches!(err, Err(EngineError::IncompleteFace)));
    }

    #[test]
    fn test_slot_drops_frames_while_busy() {
        let slot = FrameSlot::default();
        let frame = || Frame::new(RgbImage::new(2, 2), 0);
        // Nobody waiting: dropped.
        slot.offer(frame());
        assert_eq!(slot.dropped(), 1);
        assert!(matches!(slot.take(Duration::from_millis(10)), Take::Empty));
        slot.close();
        assert!(matches!(slot.take(Duration::from_millis(10)), Take::Closed));
    }
}
