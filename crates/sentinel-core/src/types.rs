use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::signature::FaceSignature;

/// A 2-D position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Axis-aligned bounding box of a detected face, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }
}

/// Named facial landmarks reported by the face detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Landmark {
    LeftEye,
    RightEye,
    NoseBase,
    MouthBottom,
    MouthLeft,
    MouthRight,
    LeftCheek,
    RightCheek,
}

/// A face found in one camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub landmarks: BTreeMap<Landmark, Point>,
}

impl DetectedFace {
    pub fn landmark(&self, which: Landmark) -> Option<Point> {
        self.landmarks.get(&which).copied()
    }

    /// The face with the largest bounding box, if any.
    pub fn most_prominent(faces: &[DetectedFace]) -> Option<&DetectedFace> {
        faces
            .iter()
            .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
    }
}

/// A persisted enrollment: one signature captured for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub id: String,
    pub owner_id: String,
    pub signature: FaceSignature,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}
