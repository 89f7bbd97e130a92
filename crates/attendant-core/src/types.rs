use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in source-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
        }
    }

    /// Horizontal center of the box.
    pub fn center_x(&self) -> f32 {
        self.x + self.width / 2.0
    }
}

/// Dimensions of the frame a detection was made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Why the presence gate refused the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    Initializing,
    NoFace,
    MultipleFaces,
    TooFar,
    OffCenter,
}

impl RejectReason {
    /// Guidance text shown to the person in front of the camera.
    pub fn guidance(&self) -> &'static str {
        match self {
            RejectReason::Initializing => "Initializing camera...",
            RejectReason::NoFace => "No face detected",
            RejectReason::MultipleFaces => "Multiple faces detected",
            RejectReason::TooFar => "Move closer to the camera",
            RejectReason::OffCenter => "Center your face",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.guidance())
    }
}

/// Outcome of one presence check. Never cached between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum DetectionResult {
    Accepted { bounding_box: BoundingBox },
    Rejected { reason: RejectReason },
}

pub const ACCEPTED_GUIDANCE: &str = "Perfect — capture now";

impl DetectionResult {
    pub fn rejected(reason: RejectReason) -> Self {
        DetectionResult::Rejected { reason }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, DetectionResult::Accepted { .. })
    }

    pub fn guidance(&self) -> &'static str {
        match self {
            DetectionResult::Accepted { .. } => ACCEPTED_GUIDANCE,
            DetectionResult::Rejected { reason } => reason.guidance(),
        }
    }
}

/// An encoded, normalized face crop ready for submission.
#[derive(Clone)]
pub struct CapturedSample {
    /// JPEG bytes of the square crop.
    pub jpeg: Vec<u8>,
    /// Resolution of the frame the crop was taken from.
    pub source: FrameSize,
}

impl std::fmt::Debug for CapturedSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedSample")
            .field("jpeg_bytes", &self.jpeg.len())
            .field("source", &self.source)
            .finish()
    }
}

/// One student's attendance arrival as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalRecord {
    #[serde(rename = "usn", default)]
    pub student_id: String,
    pub name: String,
    /// Server timestamp, kept verbatim: it is half of the identity key.
    pub time: String,
    #[serde(rename = "similarity", default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
    #[serde(rename = "distance", default, skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f32>,
    #[serde(rename = "late", default)]
    pub is_late: bool,
}

/// Identity of an arrival within one live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrivalKey {
    pub student_id: String,
    pub time: String,
}

impl ArrivalRecord {
    pub fn key(&self) -> ArrivalKey {
        ArrivalKey {
            student_id: self.student_id.clone(),
            time: self.time.clone(),
        }
    }
}
