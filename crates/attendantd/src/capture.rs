//! Sample collection and submission for one view.

use crate::api::ApiError;
use crate::engine::{EngineError, EngineHandle, SampleOutcome};
use attendant_core::{CapturedSample, GateThresholds, RejectReason};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("not ready: {0}")]
    NotReady(RejectReason),
    #[error("already have {0} samples")]
    QuotaReached(usize),
    #[error("need {need} samples, have {have}")]
    Incomplete { have: usize, need: usize },
    #[error("another capture is in progress")]
    Busy,
    #[error("attendance session closed")]
    Closed,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Submit(#[from] ApiError),
}

/// What the collected samples are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFlow {
    /// Face registration: exactly `quota` samples, submitted together.
    Enrollment { quota: usize },
    /// Attendance verification: one sample per submission.
    Verification,
}

impl CaptureFlow {
    pub fn quota(&self) -> usize {
        match self {
            CaptureFlow::Enrollment { quota } => *quota,
            CaptureFlow::Verification => 1,
        }
    }
}

/// Clears the busy flag when dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Result<Self, CaptureError> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::Busy);
        }
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CapturePipeline {
    flow: CaptureFlow,
    engine: EngineHandle,
    thresholds: GateThresholds,
    samples: Mutex<Vec<CapturedSample>>,
    busy: AtomicBool,
    enabled: Arc<AtomicBool>,
}

impl CapturePipeline {
    pub fn new(flow: CaptureFlow, engine: EngineHandle, thresholds: GateThresholds) -> Self {
        Self {
            flow,
            engine,
            thresholds,
            samples: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn flow(&self) -> CaptureFlow {
        self.flow
    }

    /// Switch shared with the session clock; cleared when the session closes.
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn ready_to_submit(&self) -> bool {
        self.count() == self.flow.quota()
    }

    /// Take one sample. The frame is re-checked at capture time; a stale
    /// "ready" shown by the gate does not count. Returns the sample count.
    pub async fn capture(&self) -> Result<usize, CaptureError> {
        let _busy = BusyGuard::try_acquire(&self.busy)?;
        self.capture_locked().await
    }

    /// Discard every collected sample.
    pub fn reset(&self) {
        let dropped = std::mem::take(&mut *self.lock()).len();
        if dropped > 0 {
            tracing::debug!(dropped, "samples discarded");
        }
    }

    /// Hand the collected samples to `send`. They are discarded whatever
    /// the outcome; a failed submission needs fresh captures.
    pub async fn submit<T, F, Fut>(&self, send: F) -> Result<T, CaptureError>
    where
        F: FnOnce(Vec<CapturedSample>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let _busy = BusyGuard::try_acquire(&self.busy)?;
        self.submit_locked(send).await
    }

    /// Capture and submit as one busy action (verification).
    pub async fn capture_and_submit<T, F, Fut>(&self, send: F) -> Result<T, CaptureError>
    where
        F: FnOnce(Vec<CapturedSample>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let _busy = BusyGuard::try_acquire(&self.busy)?;
        self.reset();
        self.capture_locked().await?;
        self.submit_locked(send).await
    }

    async fn capture_locked(&self) -> Result<usize, CaptureError> {
        if !self.is_enabled() {
            return Err(CaptureError::Closed);
        }
        let quota = self.flow.quota();
        if self.count() >= quota {
            return Err(CaptureError::QuotaReached(quota));
        }

        let sample = match self.engine.sample(self.thresholds).await? {
            SampleOutcome::Captured(sample) => sample,
            SampleOutcome::Rejected(reason) => return Err(CaptureError::NotReady(reason)),
        };
        // The session may have closed while the engine was working.
        if !self.is_enabled() {
            return Err(CaptureError::Closed);
        }

        let mut samples = self.lock();
        if samples.len() >= quota {
            return Err(CaptureError::QuotaReached(quota));
        }
        samples.push(sample);
        tracing::info!(count = samples.len(), quota, "sample collected");
        Ok(samples.len())
    }

    async fn submit_locked<T, F, Fut>(&self, send: F) -> Result<T, CaptureError>
    where
        F: FnOnce(Vec<CapturedSample>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        if !self.is_enabled() {
            self.reset();
            return Err(CaptureError::Closed);
        }
        let samples = std::mem::take(&mut *self.lock());
        let need = self.flow.quota();
        if samples.len() != need {
            let have = samples.len();
            // Not enough yet: keep what was collected.
            *self.lock() = samples;
            return Err(CaptureError::Incomplete { have, need });
        }
        Ok(send(samples).await?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CapturedSample>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::test_support::{centered_face, FakeCamera, ScriptedDetector};
    use attendant_hw::CameraConstraints;

    async fn pipeline(flow: CaptureFlow, detector: &ScriptedDetector) -> (FakeCamera, CapturePipeline) {
        let camera = FakeCamera::new(640, 480);
        let engine = spawn_engine(camera.session(), Box::new(detector.clone())).unwrap();
        engine.acquire(CameraConstraints::default()).await.unwrap();
        let pipeline = CapturePipeline::new(flow, engine, GateThresholds::default());
        (camera, pipeline)
    }

    #[tokio::test]
    async fn test_capture_rejected_frame_reports_reason() {
        let detector = ScriptedDetector::new(vec![]);
        let (_camera, pipeline) = pipeline(CaptureFlow::Verification, &detector).await;

        let err = pipeline.capture().await.unwrap_err();
        assert!(matches!(err, CaptureError::NotReady(RejectReason::NoFace)));

        detector.set(vec![centered_face(640, 200.0), centered_face(640, 180.0)]);
        let err = pipeline.capture().await.unwrap_err();
        assert!(matches!(err, CaptureError::NotReady(RejectReason::MultipleFaces)));
        assert_eq!(pipeline.count(), 0);
    }

    #[tokio::test]
    async fn test_enrollment_needs_exactly_quota() {
        let detector = ScriptedDetector::new(vec![centered_face(640, 200.0)]);
        let (_camera, pipeline) = pipeline(CaptureFlow::Enrollment { quota: 3 }, &detector).await;

        assert_eq!(pipeline.capture().await.unwrap(), 1);
        assert_eq!(pipeline.capture().await.unwrap(), 2);
        let err = pipeline.submit(|_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, CaptureError::Incomplete { have: 2, need: 3 }));
        assert_eq!(pipeline.count(), 2);

        assert_eq!(pipeline.capture().await.unwrap(), 3);
        assert!(pipeline.ready_to_submit());
        assert!(matches!(pipeline.capture().await, Err(CaptureError::QuotaReached(3))));

        let sent = pipeline.submit(|samples| async move { Ok(samples.len()) }).await.unwrap();
        assert_eq!(sent, 3);
        assert_eq!(pipeline.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_submission_discards_samples() {
        let detector = ScriptedDetector::new(vec![centered_face(640, 200.0)]);
        let (_camera, pipeline) = pipeline(CaptureFlow::Verification, &detector).await;

        let err = pipeline
            .capture_and_submit(|_| async { Err::<(), _>(ApiError::Rejected("Face mismatch".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Submit(ApiError::Rejected(_))));
        assert_eq!(pipeline.count(), 0);
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn test_reset_discards_samples() {
        let detector = ScriptedDetector::new(vec![centered_face(640, 200.0)]);
        let (_camera, pipeline) = pipeline(CaptureFlow::Enrollment { quota: 3 }, &detector).await;
        pipeline.capture().await.unwrap();
        pipeline.reset();
        assert_eq!(pipeline.count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_pipeline_refuses_capture() {
        let detector = ScriptedDetector::new(vec![centered_face(640, 200.0)]);
        let (_camera, pipeline) = pipeline(CaptureFlow::Verification, &detector).await;
        pipeline.enabled_flag().store(false, Ordering::Release);
        assert!(matches!(pipeline.capture().await, Err(CaptureError::Closed)));
    }

    #[tokio::test]
    async fn test_second_trigger_while_busy_is_rejected() {
        let detector = ScriptedDetector::new(vec![centered_face(640, 200.0)]);
        let (_camera, pipeline) = pipeline(CaptureFlow::Verification, &detector).await;
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = pipeline.capture_and_submit(|_| async move {
            let _ = release_rx.await;
            Ok(())
        });
        let second = async {
            // Let the first submission reach its await point.
            while !pipeline.is_busy() {
                tokio::task::yield_now().await;
            }
            let result = pipeline.capture().await;
            let _ = release_tx.send(());
            result
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(matches!(second, Err(CaptureError::Busy)));
    }
}
