use std::path::PathBuf;
use std::time::Duration;

use attendant_core::GateThresholds;
use attendant_hw::CameraConstraints;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the attendance server.
    pub server_url: String,
    /// Anti-forgery token attached to every request.
    pub csrf_token: Option<String>,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the SCRFD model file.
    pub model_dir: PathBuf,
    /// Minimum face width/height in pixels.
    pub min_face_px: f32,
    /// Allowed horizontal offset of the face center, as a fraction of frame width.
    pub center_tolerance: f32,
    /// Grace period after a session's nominal end.
    pub grace_secs: i64,
    /// Samples needed before an enrollment can be submitted.
    pub enroll_samples: usize,
    /// Delay between presence checks (one display frame by default).
    pub frame_interval_ms: u64,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
}

impl Config {
    /// Load configuration from `ATTENDANT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ATTENDANT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| attendant_core::default_model_dir());

        Self {
            server_url: std::env::var("ATTENDANT_SERVER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5000".to_string()),
            csrf_token: std::env::var("ATTENDANT_CSRF_TOKEN").ok(),
            camera_device: std::env::var("ATTENDANT_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            min_face_px: env_f32("ATTENDANT_MIN_FACE_PX", 150.0),
            center_tolerance: env_f32("ATTENDANT_CENTER_TOLERANCE", 0.20),
            grace_secs: env_parse("ATTENDANT_GRACE_SECS", 30),
            enroll_samples: env_parse("ATTENDANT_ENROLL_SAMPLES", 3),
            frame_interval_ms: env_parse("ATTENDANT_FRAME_INTERVAL_MS", 33),
            warmup_frames: env_parse("ATTENDANT_WARMUP_FRAMES", 4),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn thresholds(&self) -> GateThresholds {
        GateThresholds {
            min_face_px: self.min_face_px,
            max_center_offset: self.center_tolerance,
        }
    }

    pub fn constraints(&self) -> CameraConstraints {
        CameraConstraints {
            device: self.camera_device.clone(),
            ..CameraConstraints::default()
        }
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".to_string(),
            csrf_token: None,
            camera_device: "/dev/video0".to_string(),
            model_dir: attendant_core::default_model_dir(),
            min_face_px: 150.0,
            center_tolerance: 0.20,
            grace_secs: 30,
            enroll_samples: 3,
            frame_interval_ms: 33,
            warmup_frames: 4,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_parse(key, default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
