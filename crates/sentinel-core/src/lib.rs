//! sentinel-core: intrusion detection primitives.
//!
//! Landmark-based face signatures and their cosine matcher, the enrollment
//! guide-region dwell tracker, the motion anomaly state machine, and the
//! lock-method abstraction. Nothing in this crate performs I/O.

pub mod anomaly;
pub mod guide;
pub mod lock;
pub mod matcher;
pub mod signature;
pub mod types;

pub use anomaly::{AnomalyDetector, AnomalyPolicy, DetectorState, MotionSample, SensorKind, Trigger};
pub use guide::{DwellTracker, GuideRegion};
pub use lock::{Credential, LockMethod, LockVerifier};
pub use matcher::{CosineMatcher, MatchResult, Matcher, MATCH_THRESHOLD};
pub use signature::{extract_signature, FaceSignature};
pub use types::{BoundingBox, DetectedFace, EnrollmentRecord, Landmark, Point};
