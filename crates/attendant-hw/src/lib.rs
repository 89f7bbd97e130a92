//! attendant-hw — Camera access with single ownership and forced release.
//!
//! A [`CameraSession`] owns at most one live [`StreamHandle`]; the
//! [`StreamRegistry`] tracks every handle so any teardown trigger can stop
//! them all through the same path.

pub mod camera;
pub mod frame;
pub mod registry;
pub mod session;
pub mod stream;

pub use camera::V4lBackend;
pub use frame::Frame;
pub use registry::{ReleaseTrigger, StreamRegistry};
pub use session::CameraSession;
pub use stream::{CameraBackend, CameraConstraints, DeviceError, DisplaySurface, StreamHandle, StreamId, VideoTrack};
