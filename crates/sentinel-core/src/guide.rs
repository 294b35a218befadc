//! Enrollment guide region and dwell timing.
//!
//! During enrollment the owner holds their face inside an elliptical guide
//! region. Capture triggers only after the face centre has stayed inside it
//! continuously for the dwell time; leaving the region or losing the face
//! restarts the timer.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::types::Point;

/// Continuous time a face must stay in the guide region before capture.
pub const DEFAULT_DWELL: Duration = Duration::from_millis(3000);

/// Axis-aligned ellipse in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuideRegion {
    pub center_x: f32,
    pub center_y: f32,
    pub radius_x: f32,
    pub radius_y: f32,
}

impl GuideRegion {
    /// Region centred in a frame of the given size, spanning most of it.
    pub fn centered(frame_width: u32, frame_height: u32) -> Self {
        Self {
            center_x: frame_width as f32 / 2.0,
            center_y: frame_height as f32 / 2.0,
            radius_x: frame_width as f32 * 0.35,
            radius_y: frame_height as f32 * 0.45,
        }
    }

    pub fn contains(&self, p: Point) -> bool {
        if self.radius_x <= 0.0 || self.radius_y <= 0.0 {
            return false;
        }
        let dx = (p.x - self.center_x) / self.radius_x;
        let dy = (p.y - self.center_y) / self.radius_y;
        dx * dx + dy * dy <= 1.0
    }
}

/// Tracks how long a face has continuously stayed inside the guide region.
#[derive(Debug, Clone)]
pub struct DwellTracker {
    required: Duration,
    entered_at: Option<Instant>,
}

impl DwellTracker {
    pub fn new(required: Duration) -> Self {
        Self {
            required,
            entered_at: None,
        }
    }

    /// Feed one observation. `face_center` is `None` when no face was found.
    ///
    /// Returns true once the face has dwelled for the required time.
    pub fn observe(&mut self, region: &GuideRegion, face_center: Option<Point>, now: Instant) -> bool {
        match face_center {
            Some(p) if region.contains(p) => {
                let since = *self.entered_at.get_or_insert(now);
                now.saturating_duration_since(since) >= self.required
            }
            _ => {
                self.entered_at = None;
                false
            }
        }
    }

    pub fn is_inside(&self) -> bool {
        self.entered_at.is_some()
    }

    pub fn reset(&mut self) {
        self.entered_at = None;
    }
}

impl Default for DwellTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DWELL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> GuideRegion {
        GuideRegion::centered(640, 480)
    }

    const INSIDE: Point = Point { x: 320.0, y: 240.0 };
    const OUTSIDE: Point = Point { x: 5.0, y: 5.0 };

    #[test]
    fn test_contains() {
        let r = region();
        assert!(r.contains(INSIDE));
        assert!(!r.contains(OUTSIDE));
        // On the horizontal edge
        assert!(r.contains(Point { x: 320.0 + r.radius_x, y: 240.0 }));
    }

    #[test]
    fn test_degenerate_region_contains_nothing() {
        let r = GuideRegion { center_x: 0.0, center_y: 0.0, radius_x: 0.0, radius_y: 10.0 };
        assert!(!r.contains(Point { x: 0.0, y: 0.0 }));
    }

    #[test]
    fn test_dwell_completes_after_required_time() {
        let r = region();
        let t0 = Instant::now();
        let mut dwell = DwellTracker::default();
        assert!(!dwell.observe(&r, Some(INSIDE), t0));
        assert!(!dwell.observe(&r, Some(INSIDE), t0 + Duration::from_millis(2999)));
        assert!(dwell.observe(&r, Some(INSIDE), t0 + Duration::from_millis(3000)));
    }

    #[test]
    fn test_dwell_resets_when_face_leaves() {
        let r = region();
        let t0 = Instant::now();
        let mut dwell = DwellTracker::default();
        dwell.observe(&r, Some(INSIDE), t0);
        dwell.observe(&r, Some(OUTSIDE), t0 + Duration::from_millis(2000));
        assert!(!dwell.is_inside());
        assert!(!dwell.observe(&r, Some(INSIDE), t0 + Duration::from_millis(3500)));
        assert!(dwell.observe(&r, Some(INSIDE), t0 + Duration::from_millis(6500)));
    }

    #[test]
    fn test_dwell_resets_when_face_lost() {
        let r = region();
        let t0 = Instant::now();
        let mut dwell = DwellTracker::default();
        dwell.observe(&r, Some(INSIDE), t0);
        assert!(!dwell.observe(&r, None, t0 + Duration::from_millis(2500)));
        assert!(!dwell.observe(&r, Some(INSIDE), t0 + Duration::from_millis(3100)));
    }
}
