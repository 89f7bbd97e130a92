//! attendant-core — Domain logic for the attendance capture engine.
//!
//! Everything here is free of hardware and I/O: presence classification,
//! sample normalization, the session countdown, arrival deduplication and
//! risk scoring. The SCRFD detector is the one piece that touches a model
//! file.

pub mod clock;
pub mod crop;
pub mod detector;
pub mod feed;
pub mod presence;
pub mod risk;
pub mod types;

pub use clock::{ClockEvent, ClockState, SessionClock, SessionWindow};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use presence::{classify, GateThresholds};
pub use risk::{score, RiskLabel, RiskTier, TrustAssessment};
pub use types::{ArrivalKey, ArrivalRecord, BoundingBox, CapturedSample, DetectionResult, FrameSize, RejectReason};

/// Default directory for model files: `$XDG_DATA_HOME/attendant/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    let data = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data.join("attendant/models")
}
