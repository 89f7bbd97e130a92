//! In-memory camera, detector and clock shared by the daemon's tests.

use crate::clock::WallClock;
use crate::live::{FeedError, PayloadStream, PushTransport};
use attendant_core::{BoundingBox, DetectorError, FaceDetector};
use attendant_hw::{CameraBackend, CameraConstraints, CameraSession, DeviceError, Frame, StreamRegistry, VideoTrack};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct FakeTrack {
    width: u32,
    height: u32,
    level: u8,
    pub stops: AtomicUsize,
}

impl VideoTrack for FakeTrack {
    fn label(&self) -> &str {
        "fake"
    }

    fn read_frame(&self) -> Result<Frame, DeviceError> {
        let data = vec![self.level; (self.width * self.height) as usize];
        Ok(Frame::from_gray(data, self.width, self.height, 0))
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeBackend {
    width: u32,
    height: u32,
    level: u8,
    pub deny: AtomicBool,
    pub opened: Mutex<Vec<Arc<FakeTrack>>>,
}

impl CameraBackend for FakeBackend {
    fn open(&self, constraints: &CameraConstraints) -> Result<Vec<Arc<dyn VideoTrack>>, DeviceError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied(constraints.device.clone()));
        }
        let track = Arc::new(FakeTrack {
            width: self.width,
            height: self.height,
            level: self.level,
            stops: AtomicUsize::new(0),
        });
        self.opened.lock().unwrap().push(track.clone());
        Ok(vec![track])
    }
}

/// Camera stack backed by [`FakeBackend`], with a fresh registry.
pub struct FakeCamera {
    pub backend: Arc<FakeBackend>,
    pub registry: Arc<StreamRegistry>,
    session: Arc<CameraSession>,
}

impl FakeCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_level(width, height, 128)
    }

    pub fn dark(width: u32, height: u32) -> Self {
        Self::with_level(width, height, 0)
    }

    fn with_level(width: u32, height: u32, level: u8) -> Self {
        let backend = Arc::new(FakeBackend {
            width,
            height,
            level,
            deny: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(StreamRegistry::new());
        let session = Arc::new(CameraSession::new(registry.clone(), backend.clone()));
        Self {
            backend,
            registry,
            session,
        }
    }

    pub fn session(&self) -> Arc<CameraSession> {
        self.session.clone()
    }

    pub fn stop_counts(&self) -> Vec<usize> {
        self.backend
            .opened
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.stops.load(Ordering::SeqCst))
            .collect()
    }
}

/// Detector returning whatever boxes the test last set.
#[derive(Clone)]
pub struct ScriptedDetector {
    faces: Arc<Mutex<Vec<BoundingBox>>>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    pub fn new(faces: Vec<BoundingBox>) -> Self {
        Self {
            faces: Arc::new(Mutex::new(faces)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set(&self, faces: Vec<BoundingBox>) {
        *self.faces.lock().unwrap() = faces;
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, _frame: &[u8], _width: u32, _height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.faces.lock().unwrap().clone())
    }
}

/// A square face of the given size, horizontally centered.
pub fn centered_face(frame_width: u32, size: f32) -> BoundingBox {
    BoundingBox::new((frame_width as f32 - size) / 2.0, 100.0, size, size)
}

/// Wall clock that moves with tokio's (pausable) clock.
pub struct AnchoredClock {
    wall: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl AnchoredClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            start: tokio::time::Instant::now(),
        }
    }
}

impl WallClock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now() - self.start;
        self.wall + chrono::Duration::from_std(elapsed).unwrap()
    }
}

/// Push transport whose connections are fed by the test.
#[derive(Default)]
pub struct ChannelTransport {
    pending: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<String, FeedError>>>>,
}

impl ChannelTransport {
    /// Queue a connection for the next `open`.
    pub fn connection(&self) -> mpsc::UnboundedSender<Result<String, FeedError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().push_back(rx);
        tx
    }
}

impl PushTransport for ChannelTransport {
    fn open(&self, _session_id: i64) -> PayloadStream {
        match self.pending.lock().unwrap().pop_front() {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed(),
            None => stream::empty().boxed(),
        }
    }
}
