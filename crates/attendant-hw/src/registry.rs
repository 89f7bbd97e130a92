//! Bookkeeping of every live camera stream.
//!
//! The registry is the only thing allowed to force-release streams from
//! outside their owning [`CameraSession`](crate::CameraSession). Every
//! teardown trigger ends in [`StreamRegistry::release_all`].

use crate::stream::{StreamHandle, StreamId, VideoTrack};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// What asked for a stream to be released. Logged, never branched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseTrigger {
    Explicit,
    Navigation,
    Hidden,
    Unload,
    Reacquire,
    SessionClosed,
}

impl std::fmt::Display for ReleaseTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReleaseTrigger::Explicit => "explicit",
            ReleaseTrigger::Navigation => "navigation",
            ReleaseTrigger::Hidden => "hidden",
            ReleaseTrigger::Unload => "unload",
            ReleaseTrigger::Reacquire => "reacquire",
            ReleaseTrigger::SessionClosed => "session-closed",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
pub struct StreamRegistry {
    next_id: AtomicU64,
    streams: Mutex<BTreeMap<StreamId, StreamHandle>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap freshly opened tracks in a handle and register it.
    pub fn adopt(&self, tracks: Vec<Arc<dyn VideoTrack>>) -> StreamHandle {
        let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = StreamHandle::new(id, tracks);
        self.lock().insert(id, handle.clone());
        tracing::debug!(stream = %id, tracks = handle.track_count(), "stream registered");
        handle
    }

    /// Stop one stream and forget it. No-op for an already released handle.
    pub fn release(&self, handle: &StreamHandle, trigger: ReleaseTrigger) -> bool {
        self.lock().remove(&handle.id());
        let stopped = handle.stop();
        if stopped {
            tracing::info!(stream = %handle.id(), %trigger, "camera stream released");
        }
        stopped
    }

    /// Stop every registered stream. Safe to call any number of times from any
    /// thread; each track is stopped exactly once. Returns how many streams
    /// this call stopped.
    pub fn release_all(&self, trigger: ReleaseTrigger) -> usize {
        let drained: Vec<StreamHandle> = std::mem::take(&mut *self.lock()).into_values().collect();
        let stopped = drained.iter().filter(|h| h.stop()).count();
        if stopped > 0 {
            tracing::info!(count = stopped, %trigger, "released all camera streams");
        }
        stopped
    }

    pub fn live_count(&self) -> usize {
        self.lock().values().filter(|h| h.is_live()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<StreamId, StreamHandle>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}
