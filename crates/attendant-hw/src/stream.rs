//! Stream handles and the traits a camera backend implements.

use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no camera acquired")]
    NotAcquired,
    #[error("stream already released")]
    Released,
}

/// Requested capture parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConstraints {
    pub device: String,
    /// Preferred width; the driver may negotiate something else.
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// One underlying video track of a stream.
pub trait VideoTrack: Send + Sync {
    fn label(&self) -> &str;
    fn read_frame(&self) -> Result<Frame, DeviceError>;
    /// Stop the track and free the hardware. Called at most once per track.
    fn stop(&self);
}

/// Something that can open a camera stream.
pub trait CameraBackend: Send + Sync {
    fn open(&self, constraints: &CameraConstraints) -> Result<Vec<Arc<dyn VideoTrack>>, DeviceError>;
}

/// Where a live stream is shown. Detached when the stream is released.
pub trait DisplaySurface: Send + Sync {
    fn attach(&self, stream: StreamId);
    fn detach(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

struct StreamInner {
    id: StreamId,
    tracks: Vec<Arc<dyn VideoTrack>>,
    surface: Mutex<Option<Arc<dyn DisplaySurface>>>,
    released: AtomicBool,
}

/// Shared handle to an active camera stream.
///
/// Clones refer to the same stream. [`StreamHandle::stop`] stops every track
/// exactly once no matter how many clones call it, or from where.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

impl StreamHandle {
    pub(crate) fn new(id: StreamId, tracks: Vec<Arc<dyn VideoTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id,
                tracks,
                surface: Mutex::new(None),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn is_live(&self) -> bool {
        !self.inner.released.load(Ordering::Acquire)
    }

    pub fn track_count(&self) -> usize {
        self.inner.tracks.len()
    }

    /// Bind the stream to a display surface.
    pub fn bind(&self, surface: Arc<dyn DisplaySurface>) {
        if !self.is_live() {
            return;
        }
        surface.attach(self.inner.id);
        let mut slot = self.inner.surface.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(surface);
    }

    /// Read a frame from the first track.
    pub fn read_frame(&self) -> Result<Frame, DeviceError> {
        if !self.is_live() {
            return Err(DeviceError::Released);
        }
        let track = self.inner.tracks.first().ok_or(DeviceError::NotAcquired)?;
        track.read_frame()
    }

    /// Stop all tracks and detach the surface. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        for track in &self.inner.tracks {
            tracing::debug!(stream = %self.inner.id, track = track.label(), "stopping track");
            track.stop();
        }
        let surface = self.inner.surface.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(surface) = surface {
            surface.detach();
        }
        true
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.len())
            .field("live", &self.is_live())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let backend = FakeBackend::new(2);
        let tracks = backend.open(&CameraConstraints::default()).unwrap();
        let handle = StreamHandle::new(StreamId(1), tracks);
        let clone = handle.clone();

        assert!(handle.stop());
        assert!(!clone.stop());
        assert!(!handle.stop());
        assert_eq!(backend.stop_counts(), vec![1, 1]);
        assert!(matches!(clone.read_frame(), Err(DeviceError::Released)));
    }

    #[test]
    fn test_stop_detaches_surface() {
        let backend = FakeBackend::new(1);
        let handle = StreamHandle::new(StreamId(3), backend.open(&CameraConstraints::default()).unwrap());
        let surface = Arc::new(RecordingSurface::default());
        handle.bind(surface.clone());
        assert_eq!(*surface.attached.lock().unwrap(), Some(StreamId(3)));

        handle.stop();
        handle.stop();
        assert_eq!(*surface.attached.lock().unwrap(), None);
        assert_eq!(surface.detaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_stop_stops_each_track_once() {
        let backend = FakeBackend::new(3);
        let handle = StreamHandle::new(StreamId(9), backend.open(&CameraConstraints::default()).unwrap());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let h = handle.clone();
                std::thread::spawn(move || h.stop())
            })
            .collect();
        let winners = threads.into_iter().map(|t| t.join().unwrap()).filter(|&won| won).count();

        assert_eq!(winners, 1);
        assert_eq!(backend.stop_counts(), vec![1, 1, 1]);
    }
}
