//! Exclusive camera ownership for one logical capture session.

use crate::frame::Frame;
use crate::registry::{ReleaseTrigger, StreamRegistry};
use crate::stream::{CameraBackend, CameraConstraints, DeviceError, DisplaySurface, StreamHandle};
use std::sync::{Arc, Mutex};

/// Owns at most one live stream at a time and exposes a single teardown.
pub struct CameraSession {
    registry: Arc<StreamRegistry>,
    backend: Arc<dyn CameraBackend>,
    surface: Option<Arc<dyn DisplaySurface>>,
    current: Mutex<Option<StreamHandle>>,
}

impl CameraSession {
    pub fn new(registry: Arc<StreamRegistry>, backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            registry,
            backend,
            surface: None,
            current: Mutex::new(None),
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn DisplaySurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Open the camera. Every registered stream is force-released first, so
    /// after this returns the new handle is the only live one.
    pub fn acquire(&self, constraints: &CameraConstraints) -> Result<StreamHandle, DeviceError> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());

        self.registry.release_all(ReleaseTrigger::Reacquire);
        current.take();

        let tracks = self.backend.open(constraints)?;
        if tracks.is_empty() {
            return Err(DeviceError::DeviceNotFound(constraints.device.clone()));
        }
        let handle = self.registry.adopt(tracks);
        if let Some(surface) = &self.surface {
            handle.bind(surface.clone());
        }
        tracing::info!(device = %constraints.device, stream = %handle.id(), "camera acquired");

        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Release the owned stream, if any. Safe to call repeatedly.
    pub fn release(&self, trigger: ReleaseTrigger) {
        let handle = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            self.registry.release(&handle, trigger);
        }
    }

    /// Read a frame from the owned stream.
    pub fn read_frame(&self) -> Result<Frame, DeviceError> {
        let handle = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DeviceError::NotAcquired)?;
        handle.read_frame()
    }

    /// Whether a stream is owned and has not been stopped by any trigger.
    pub fn is_active(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| h.is_live())
    }
}
