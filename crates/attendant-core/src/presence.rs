//! Geometric acceptance rules for the presence gate.
//!
//! Classification is a pure function of the detected boxes and the frame
//! size: the same inputs always produce the same verdict.

use crate::types::{BoundingBox, DetectionResult, FrameSize, RejectReason};

/// Minimum face width and height, in pixels, before the subject counts as close enough.
pub const MIN_FACE_PX: f32 = 150.0;
/// Maximum horizontal offset of the face center, as a fraction of frame width.
pub const MAX_CENTER_OFFSET: f32 = 0.20;

/// Acceptance thresholds for [`classify`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateThresholds {
    pub min_face_px: f32,
    pub max_center_offset: f32,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_face_px: MIN_FACE_PX,
            max_center_offset: MAX_CENTER_OFFSET,
        }
    }
}

/// Classify a set of detections against the frame they came from.
///
/// Rules are evaluated in order: face count, then size, then centering.
pub fn classify(faces: &[BoundingBox], frame: FrameSize, thresholds: &GateThresholds) -> DetectionResult {
    let face = match faces {
        [] => return DetectionResult::rejected(RejectReason::NoFace),
        [face] => face,
        _ => return DetectionResult::rejected(RejectReason::MultipleFaces),
    };

    if face.width < thresholds.min_face_px || face.height < thresholds.min_face_px {
        return DetectionResult::rejected(RejectReason::TooFar);
    }

    let frame_width = frame.width as f32;
    let offset = (face.center_x() - frame_width / 2.0).abs();
    if offset > frame_width * thresholds.max_center_offset {
        return DetectionResult::rejected(RejectReason::OffCenter);
    }

    DetectionResult::Accepted { bounding_box: *face }
}
