//! Landmark face signatures.
//!
//! A signature is the positional encoding of eight facial landmarks,
//! serialized as a comma-joined list of `x,y` pairs. It is a lightweight
//! identity proxy, not a learned embedding: enrollment and verification must
//! serialize landmarks in the same order for the matcher to compare vectors
//! positionally.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{DetectedFace, Landmark};

/// Serialization order of landmarks inside a signature.
pub const SIGNATURE_LANDMARKS: [Landmark; 8] = [
    Landmark::LeftEye,
    Landmark::RightEye,
    Landmark::NoseBase,
    Landmark::MouthBottom,
    Landmark::MouthLeft,
    Landmark::MouthRight,
    Landmark::LeftCheek,
    Landmark::RightCheek,
];

/// Number of scalars in a decoded valid signature (8 landmarks × 2).
pub const SIGNATURE_LEN: usize = SIGNATURE_LANDMARKS.len() * 2;

/// Faces must be strictly larger than this in both dimensions.
pub const MIN_FACE_SIZE: f32 = 50.0;

/// Encoded landmark signature. The empty signature means "extraction failed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceSignature(String);

impl FaceSignature {
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Wrap previously encoded text (e.g. read back from storage).
    pub fn from_encoded(text: impl Into<String>) -> Self {
        Self(text.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the text decodes to exactly [`SIGNATURE_LEN`] finite values.
    pub fn is_valid(&self) -> bool {
        self.decode().len() == SIGNATURE_LEN
    }

    /// Parse into a numeric vector.
    ///
    /// Fails closed: any unparsable or non-finite element yields an empty
    /// vector, never a partial one.
    pub fn decode(&self) -> Vec<f32> {
        if self.0.is_empty() {
            return Vec::new();
        }
        let mut values = Vec::with_capacity(SIGNATURE_LEN);
        for part in self.0.split(',') {
            match part.trim().parse::<f32>() {
                Ok(v) if v.is_finite() => values.push(v),
                _ => return Vec::new(),
            }
        }
        values
    }
}

impl fmt::Display for FaceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the signature for a detected face.
///
/// Returns [`FaceSignature::empty`] if any of the eight landmarks is missing
/// or the bounding box is not larger than [`MIN_FACE_SIZE`] on both axes.
pub fn extract_signature(face: &DetectedFace) -> FaceSignature {
    if face.bbox.width <= MIN_FACE_SIZE || face.bbox.height <= MIN_FACE_SIZE {
        tracing::debug!(
            width = face.bbox.width,
            height = face.bbox.height,
            "face too small for signature"
        );
        return FaceSignature::empty();
    }

    let mut pairs = Vec::with_capacity(SIGNATURE_LANDMARKS.len());
    for which in SIGNATURE_LANDMARKS {
        let Some(p) = face.landmark(which) else {
            tracing::debug!(landmark = ?which, "missing landmark");
            return FaceSignature::empty();
        };
        if !p.x.is_finite() || !p.y.is_finite() {
            return FaceSignature::empty();
        }
        pairs.push(format!("{},{}", p.x, p.y));
    }

    FaceSignature(pairs.join(","))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{BoundingBox, Point};
    use std::collections::BTreeMap;

    pub(crate) fn full_face(offset: f32) -> DetectedFace {
        let mut landmarks = BTreeMap::new();
        for (i, which) in SIGNATURE_LANDMARKS.iter().enumerate() {
            landmarks.insert(
                *which,
                Point {
                    x: 100.0 + i as f32 * 7.5 + offset,
                    y: 120.0 + i as f32 * 3.25,
                },
            );
        }
        DetectedFace {
            bbox: BoundingBox { x: 80.0, y: 90.0, width: 120.0, height: 140.0 },
            confidence: 0.95,
            landmarks,
        }
    }

    #[test]
    fn test_extract_valid_face() {
        let sig = extract_signature(&full_face(0.0));
        assert!(!sig.is_empty());
        assert!(sig.is_valid());
        assert_eq!(sig.decode().len(), SIGNATURE_LEN);
    }

    #[test]
    fn test_extract_length_constant_across_faces() {
        for offset in [0.0, 3.0, 17.5, 240.0] {
            let sig = extract_signature(&full_face(offset));
            assert_eq!(sig.decode().len(), SIGNATURE_LEN, "offset {offset}");
        }
    }

    #[test]
    fn test_extract_order_is_fixed() {
        let face = full_face(0.0);
        let values = extract_signature(&face).decode();
        let left_eye = face.landmark(Landmark::LeftEye).unwrap();
        let right_cheek = face.landmark(Landmark::RightCheek).unwrap();
        assert_eq!((values[0], values[1]), (left_eye.x, left_eye.y));
        assert_eq!((values[14], values[15]), (right_cheek.x, right_cheek.y));
    }

    #[test]
    fn test_extract_missing_any_landmark_is_empty() {
        for which in SIGNATURE_LANDMARKS {
            let mut face = full_face(0.0);
            face.landmarks.remove(&which);
            assert!(extract_signature(&face).is_empty(), "missing {which:?}");
        }
    }

    #[test]
    fn test_extract_small_box_is_empty() {
        let mut face = full_face(0.0);
        face.bbox.width = 50.0;
        assert!(extract_signature(&face).is_empty());

        let mut face = full_face(0.0);
        face.bbox.height = 42.0;
        assert!(extract_signature(&face).is_empty());
    }

    #[test]
    fn test_decode_fails_closed() {
        assert!(FaceSignature::from_encoded("1.0,2.0,abc").decode().is_empty());
        assert!(FaceSignature::from_encoded("1.0,,2.0").decode().is_empty());
        assert!(FaceSignature::from_encoded("NaN,1.0").decode().is_empty());
        assert!(FaceSignature::from_encoded("inf,1.0").decode().is_empty());
        assert!(FaceSignature::empty().decode().is_empty());
    }

    #[test]
    fn test_from_encoded_trims_whitespace() {
        let sig = FaceSignature::from_encoded("  1.5,2.5\n");
        assert_eq!(sig.decode(), vec![1.5, 2.5]);
        assert!(!sig.is_valid());
    }
}
