use attendant_core::crop::{self, CropError};
use attendant_core::{
    classify, CapturedSample, DetectionResult, DetectorError, FaceDetector, FrameSize, GateThresholds,
    RejectReason,
};
use attendant_hw::{CameraConstraints, CameraSession, DeviceError, StreamHandle};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] DeviceError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("could not encode sample: {0}")]
    Crop(#[from] CropError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of asking the engine for a normalized sample.
#[derive(Debug)]
pub enum SampleOutcome {
    Captured(CapturedSample),
    Rejected(RejectReason),
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Acquire {
        constraints: CameraConstraints,
        reply: oneshot::Sender<Result<StreamHandle, EngineError>>,
    },
    Probe {
        thresholds: GateThresholds,
        reply: oneshot::Sender<Result<DetectionResult, EngineError>>,
    },
    Sample {
        thresholds: GateThresholds,
        reply: oneshot::Sender<Result<SampleOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    camera: Arc<CameraSession>,
}

impl EngineHandle {
    /// Open the camera on the engine thread (warmup frames included).
    pub async fn acquire(&self, constraints: CameraConstraints) -> Result<StreamHandle, EngineError> {
        self.request(|reply| EngineRequest::Acquire { constraints, reply }).await
    }

    /// Read one frame and classify it.
    pub async fn probe(&self, thresholds: GateThresholds) -> Result<DetectionResult, EngineError> {
        self.request(|reply| EngineRequest::Probe { thresholds, reply }).await
    }

    /// Read one frame; if it passes the gate, crop and encode the face.
    pub async fn sample(&self, thresholds: GateThresholds) -> Result<SampleOutcome, EngineError> {
        self.request(|reply| EngineRequest::Sample { thresholds, reply }).await
    }

    /// The camera session the engine reads from.
    pub fn camera(&self) -> &Arc<CameraSession> {
        &self.camera
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the detector and serves one request at a time, so camera
/// reads and inference never run concurrently.
pub fn spawn_engine(
    camera: Arc<CameraSession>,
    mut detector: Box<dyn FaceDetector>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let session = camera.clone();

    std::thread::Builder::new()
        .name("attendant-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Acquire { constraints, reply } => {
                        let result = session.acquire(&constraints).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Probe { thresholds, reply } => {
                        let result = run_probe(&session, detector.as_mut(), &thresholds).map(|(_, r)| r);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Sample { thresholds, reply } => {
                        let result = run_sample(&session, detector.as_mut(), &thresholds);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, camera })
}

/// Read a frame and run it through detection and the presence rules.
/// Dark frames (exposure still settling) count as initializing.
fn run_probe(
    session: &CameraSession,
    detector: &mut dyn FaceDetector,
    thresholds: &GateThresholds,
) -> Result<(attendant_hw::Frame, DetectionResult), EngineError> {
    let frame = session.read_frame()?;
    if frame.is_dark {
        tracing::trace!(sequence = frame.sequence, brightness = frame.avg_brightness(), "dark frame");
        return Ok((frame, DetectionResult::rejected(RejectReason::Initializing)));
    }
    let faces = detector.detect(&frame.data, frame.width, frame.height)?;
    let result = classify(&faces, FrameSize::new(frame.width, frame.height), thresholds);
    tracing::trace!(faces = faces.len(), accepted = result.is_accepted(), "probe");
    Ok((frame, result))
}

fn run_sample(
    session: &CameraSession,
    detector: &mut dyn FaceDetector,
    thresholds: &GateThresholds,
) -> Result<SampleOutcome, EngineError> {
    let (frame, result) = run_probe(session, detector, thresholds)?;
    match result {
        DetectionResult::Rejected { reason } => Ok(SampleOutcome::Rejected(reason)),
        DetectionResult::Accepted { bounding_box } => {
            let sample = crop::normalize(&frame.data, FrameSize::new(frame.width, frame.height), &bounding_box)?;
            tracing::debug!(bytes = sample.jpeg.len(), confidence = bounding_box.confidence, "sample captured");
            Ok(SampleOutcome::Captured(sample))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{centered_face, FakeCamera, ScriptedDetector};
    use attendant_core::BoundingBox;

    #[tokio::test]
    async fn test_probe_without_camera_is_not_acquired() {
        let camera = FakeCamera::new(640, 480);
        let engine = spawn_engine(camera.session(), Box::new(ScriptedDetector::new(vec![]))).unwrap();
        let err = engine.probe(GateThresholds::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Camera(DeviceError::NotAcquired)));
    }

    #[tokio::test]
    async fn test_probe_classifies_frame() {
        let camera = FakeCamera::new(640, 480);
        let detector = ScriptedDetector::new(vec![centered_face(640, 200.0)]);
        let engine = spawn_engine(camera.session(), Box::new(detector.clone())).unwrap();
        engine.acquire(CameraConstraints::default()).await.unwrap();

        assert!(engine.probe(GateThresholds::default()).await.unwrap().is_accepted());

        detector.set(vec![BoundingBox::new(10.0, 10.0, 80.0, 80.0)]);
        assert_eq!(
            engine.probe(GateThresholds::default()).await.unwrap(),
            DetectionResult::rejected(RejectReason::TooFar)
        );
    }

    #[tokio::test]
    async fn test_dark_frame_is_initializing() {
        let camera = FakeCamera::dark(640, 480);
        let detector = ScriptedDetector::new(vec![centered_face(640, 200.0)]);
        let engine = spawn_engine(camera.session(), Box::new(detector)).unwrap();
        engine.acquire(CameraConstraints::default()).await.unwrap();

        assert_eq!(
            engine.probe(GateThresholds::default()).await.unwrap(),
            DetectionResult::rejected(RejectReason::Initializing)
        );
    }

    #[tokio::test]
    async fn test_sample_encodes_jpeg() {
        let camera = FakeCamera::new(640, 480);
        let detector = ScriptedDetector::new(vec![centered_face(640, 200.0)]);
        let engine = spawn_engine(camera.session(), Box::new(detector)).unwrap();
        engine.acquire(CameraConstraints::default()).await.unwrap();

        match engine.sample(GateThresholds::default()).await.unwrap() {
            SampleOutcome::Captured(sample) => {
                assert_eq!(&sample.jpeg[..2], &[0xFF, 0xD8]);
                assert_eq!(sample.source, FrameSize::new(640, 480));
            }
            other => panic!("expected a sample, got {other:?}"),
        }
    }
}
