//! The screens the daemon drives and the controller that switches them.
//!
//! Opening a view always tears down the previous one first (camera off,
//! loops cancelled). Every await inside an `open_*` call is followed by a
//! liveness check so a view replaced mid-open never installs itself or
//! keeps a camera.

use crate::api::{ActiveSession, ApiError, AttendanceServer};
use crate::capture::{CaptureError, CaptureFlow, CapturePipeline};
use crate::clock::{spawn_clock, ClockStatus, CloseActions, WallClock};
use crate::config::Config;
use crate::context::{Activation, ViewContext};
use crate::engine::{EngineError, EngineHandle};
use crate::events::{Notifier, ToastLevel, UiEvent};
use crate::gate::{spawn_gate, GateStatus};
use crate::live::{FeedEvent, LiveFeed, Subscription};
use attendant_core::risk::RiskTier;
use attendant_core::{score, ArrivalKey, ArrivalRecord, SessionClock, TrustAssessment};
use attendant_hw::{DeviceError, ReleaseTrigger, StreamHandle};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Error, Debug)]
pub enum ViewError {
    #[error("no {0} view is open")]
    NotOpen(&'static str),
    #[error("view was closed while opening")]
    Superseded,
    #[error("{0}")]
    Unavailable(&'static str),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Everything a view needs, shared for the daemon's lifetime.
pub struct Services {
    pub config: Config,
    pub ctx: Arc<ViewContext>,
    pub engine: EngineHandle,
    pub server: Arc<dyn AttendanceServer>,
    pub feed: LiveFeed,
    pub notifier: Notifier,
    pub wall: Arc<dyn WallClock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendancePhase {
    NoSession,
    AlreadyMarked,
    Open,
    Recorded,
}

impl AttendancePhase {
    pub fn message(&self) -> &'static str {
        match self {
            AttendancePhase::NoSession => "No Active Attendance Session",
            AttendancePhase::AlreadyMarked => "Attendance Already Marked",
            AttendancePhase::Open => "Active Session",
            AttendancePhase::Recorded => "Attendance Recorded",
        }
    }
}

/// Camera-side state of a view that captures.
struct LiveCamera {
    pipeline: Arc<CapturePipeline>,
    gate: watch::Receiver<GateStatus>,
    stream: StreamHandle,
}

pub struct AttendanceView {
    session: ActiveSession,
    phase: Mutex<AttendancePhase>,
    camera: Option<LiveCamera>,
    clock: Option<watch::Receiver<ClockStatus>>,
}

pub struct EnrollmentView {
    camera: LiveCamera,
    registered: AtomicBool,
}

struct ReportState {
    records: Vec<ArrivalRecord>,
    keys: HashSet<ArrivalKey>,
    assessment: TrustAssessment,
    present: u64,
    connection_lost: bool,
}

impl ReportState {
    fn new(records: Vec<ArrivalRecord>) -> Self {
        let keys = records.iter().map(ArrivalRecord::key).collect();
        Self {
            assessment: score(&records),
            present: records.len() as u64,
            records,
            keys,
            connection_lost: false,
        }
    }

    /// Append unseen records and rescore. Returns how many were new.
    fn append(&mut self, arrivals: Vec<ArrivalRecord>) -> usize {
        let before = self.records.len();
        for record in arrivals {
            if self.keys.insert(record.key()) {
                self.records.push(record);
            }
        }
        let added = self.records.len() - before;
        if added > 0 {
            self.assessment = score(&self.records);
        }
        added
    }
}

pub struct ReportView {
    state: Arc<Mutex<ReportState>>,
    subscription: Subscription,
}

#[derive(Clone)]
enum View {
    Attendance(Arc<AttendanceView>),
    Enrollment(Arc<EnrollmentView>),
    Report(Arc<ReportView>),
}

/// One row of the report's review list.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewRow {
    pub name: String,
    pub usn: String,
    pub time: String,
    pub status: &'static str,
    pub warning: Option<&'static str>,
    pub similarity: Option<f32>,
    pub distance: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "view", rename_all = "kebab-case")]
pub enum ViewStatus {
    None,
    Attendance {
        phase: AttendancePhase,
        message: &'static str,
        course: Option<String>,
        gate: Option<GateStatus>,
        clock: Option<ClockStatus>,
        capture_enabled: bool,
        busy: bool,
    },
    Enrollment {
        samples: usize,
        quota: usize,
        ready_to_submit: bool,
        registered: bool,
        gate: GateStatus,
        busy: bool,
    },
    Report {
        session_id: i64,
        present: u64,
        connection_lost: bool,
        assessment: TrustAssessment,
        review: Vec<ReviewRow>,
    },
}

/// Switches between views; at most one is open at a time.
pub struct App {
    svc: Services,
    current: Mutex<Option<View>>,
}

impl App {
    pub fn new(svc: Services) -> Self {
        Self {
            svc,
            current: Mutex::new(None),
        }
    }

    pub fn services(&self) -> &Services {
        &self.svc
    }

    pub async fn open_attendance(&self) -> Result<ViewStatus, ViewError> {
        let activation = self.navigate();
        let session = self.svc.server.active_session().await;
        if !activation.is_live() {
            return Err(ViewError::Superseded);
        }
        let session = session?;

        let phase = if !session.active {
            AttendancePhase::NoSession
        } else if session.already_marked {
            AttendancePhase::AlreadyMarked
        } else {
            AttendancePhase::Open
        };
        if phase != AttendancePhase::Open {
            tracing::info!(?phase, "attendance view opened without camera");
            let view = AttendanceView {
                session,
                phase: Mutex::new(phase),
                camera: None,
                clock: None,
            };
            self.install(&activation, View::Attendance(Arc::new(view)))?;
            return Ok(self.status());
        }

        let pipeline = Arc::new(CapturePipeline::new(
            CaptureFlow::Verification,
            self.svc.engine.clone(),
            self.svc.config.thresholds(),
        ));
        let grace = self.svc.config.grace();
        let clock = session.window(self.svc.wall.now(), grace).map(|window| {
            let actions = CloseActions {
                camera: self.svc.engine.camera().clone(),
                capture_enabled: pipeline.enabled_flag(),
                notifier: self.svc.notifier.clone(),
            };
            spawn_clock(SessionClock::new(window, grace), self.svc.wall.clone(), actions, activation.clone()).0
        });

        let camera = match self.open_camera(&activation, pipeline).await {
            Ok(camera) => Some(camera),
            Err(ViewError::Superseded) => return Err(ViewError::Superseded),
            Err(e) => {
                // The countdown stays visible even without a camera.
                let view = AttendanceView {
                    session,
                    phase: Mutex::new(phase),
                    camera: None,
                    clock,
                };
                self.install(&activation, View::Attendance(Arc::new(view)))?;
                return Err(e);
            }
        };

        let view = AttendanceView {
            session,
            phase: Mutex::new(phase),
            camera,
            clock,
        };
        self.install(&activation, View::Attendance(Arc::new(view)))?;
        Ok(self.status())
    }

    /// Verify the face in front of the camera and mark attendance.
    pub async fn mark(&self, latitude: f64, longitude: f64) -> Result<String, ViewError> {
        let view = match self.current() {
            Some(View::Attendance(view)) => view,
            _ => return Err(ViewError::NotOpen("attendance")),
        };
        let phase = *lock(&view.phase);
        if phase != AttendancePhase::Open {
            return Err(ViewError::Unavailable(phase.message()));
        }
        let camera = view.camera.as_ref().ok_or(ViewError::Unavailable("Camera is not running"))?;

        let server = self.svc.server.clone();
        let session = view.session.clone();
        let result = camera
            .pipeline
            .capture_and_submit(|mut samples| async move {
                let Some(sample) = samples.pop() else {
                    return Err(ApiError::Rejected("Camera capture failed".to_string()));
                };
                server.mark_attendance(session, sample, latitude, longitude).await
            })
            .await;

        match result {
            Ok(message) => {
                *lock(&view.phase) = AttendancePhase::Recorded;
                self.svc.ctx.registry().release(&camera.stream, ReleaseTrigger::Explicit);
                self.svc.notifier.toast(ToastLevel::Success, "Attendance Marked Successfully");
                tracing::info!(session_id = ?view.session.session_id, "attendance recorded");
                Ok(message)
            }
            Err(e) => {
                self.report_capture_error(&e);
                Err(e.into())
            }
        }
    }

    pub async fn open_enrollment(&self) -> Result<ViewStatus, ViewError> {
        let activation = self.navigate();
        let pipeline = Arc::new(CapturePipeline::new(
            CaptureFlow::Enrollment {
                quota: self.svc.config.enroll_samples,
            },
            self.svc.engine.clone(),
            self.svc.config.thresholds(),
        ));
        let camera = self.open_camera(&activation, pipeline).await?;
        let view = EnrollmentView {
            camera,
            registered: AtomicBool::new(false),
        };
        self.install(&activation, View::Enrollment(Arc::new(view)))?;
        Ok(self.status())
    }

    /// Take one enrollment sample. Returns how many are collected.
    pub async fn capture(&self) -> Result<usize, ViewError> {
        let view = self.enrollment()?;
        let pipeline = &view.camera.pipeline;
        let quota = pipeline.flow().quota();
        match pipeline.capture().await {
            Ok(count) if count == quota => {
                self.svc.notifier.toast(ToastLevel::Success, "Great! Now submit registration");
                Ok(count)
            }
            Ok(count) => {
                self.svc.notifier.toast(ToastLevel::Info, format!("Captured {count}/{quota}"));
                Ok(count)
            }
            Err(e) => {
                self.report_capture_error(&e);
                Err(e.into())
            }
        }
    }

    pub fn reset_captures(&self) -> Result<(), ViewError> {
        self.enrollment()?.camera.pipeline.reset();
        Ok(())
    }

    /// Upload the enrollment samples.
    pub async fn submit(&self) -> Result<String, ViewError> {
        let view = self.enrollment()?;
        let pipeline = &view.camera.pipeline;
        if !pipeline.ready_to_submit() {
            let error = CaptureError::Incomplete {
                have: pipeline.count(),
                need: pipeline.flow().quota(),
            };
            self.report_capture_error(&error);
            return Err(error.into());
        }

        self.svc.notifier.toast(ToastLevel::Info, "Registering face... please wait");
        let server = self.svc.server.clone();
        let result = pipeline
            .submit(|samples| async move { server.register_face(samples).await })
            .await;

        match result {
            Ok(message) => {
                view.registered.store(true, Ordering::Release);
                self.svc.ctx.registry().release(&view.camera.stream, ReleaseTrigger::Explicit);
                self.svc.notifier.toast(ToastLevel::Success, "Face Registered Successfully!");
                Ok(message)
            }
            Err(e) => {
                self.report_capture_error(&e);
                Err(e.into())
            }
        }
    }

    pub async fn open_report(&self, session_id: i64) -> Result<ViewStatus, ViewError> {
        let activation = self.navigate();
        let records = self.svc.server.session_students(session_id).await;
        if !activation.is_live() {
            return Err(ViewError::Superseded);
        }
        let records = records.inspect_err(|e| {
            if matches!(e, ApiError::Rejected(_)) {
                self.svc.notifier.toast(ToastLevel::Error, "Failed to load attendance");
            }
        })?;

        let state = Arc::new(Mutex::new(ReportState::new(records)));
        let (subscription, events) = self.svc.feed.subscribe(session_id, &activation);
        tokio::spawn(apply_feed(session_id, events, state.clone(), self.svc.notifier.clone()));

        let view = ReportView {
            state,
            subscription,
        };
        self.install(&activation, View::Report(Arc::new(view)))?;
        Ok(self.status())
    }

    /// Host hidden: cameras off, views stay.
    pub fn hide(&self) -> usize {
        self.svc.ctx.hide()
    }

    /// Close whatever view is open.
    pub fn leave(&self) {
        lock(&self.current).take();
        self.svc.feed.cancel();
        self.svc.ctx.teardown(ReleaseTrigger::Navigation);
    }

    pub fn shutdown(&self) -> usize {
        lock(&self.current).take();
        self.svc.ctx.shutdown()
    }

    pub fn status(&self) -> ViewStatus {
        match self.current() {
            None => ViewStatus::None,
            Some(View::Attendance(view)) => {
                let phase = *lock(&view.phase);
                ViewStatus::Attendance {
                    phase,
                    message: phase.message(),
                    course: view.session.course_name.clone(),
                    gate: view.camera.as_ref().map(|c| c.gate.borrow().clone()),
                    clock: view.clock.as_ref().map(|c| c.borrow().clone()),
                    capture_enabled: view.camera.as_ref().is_some_and(|c| c.pipeline.is_enabled()),
                    busy: view.camera.as_ref().is_some_and(|c| c.pipeline.is_busy()),
                }
            }
            Some(View::Enrollment(view)) => {
                let pipeline = &view.camera.pipeline;
                ViewStatus::Enrollment {
                    samples: pipeline.count(),
                    quota: pipeline.flow().quota(),
                    ready_to_submit: pipeline.ready_to_submit(),
                    registered: view.registered.load(Ordering::Acquire),
                    gate: view.camera.gate.borrow().clone(),
                    busy: pipeline.is_busy(),
                }
            }
            Some(View::Report(view)) => {
                let state = lock(&view.state);
                let review = state
                    .assessment
                    .ordered(&state.records)
                    .into_iter()
                    .map(|record| {
                        let (status, warning) = RiskTier::of(record).describe();
                        ReviewRow {
                            name: record.name.clone(),
                            usn: record.student_id.clone(),
                            time: record.time.clone(),
                            status,
                            warning,
                            similarity: record.similarity_score,
                            distance: record.distance_meters,
                        }
                    })
                    .collect();
                ViewStatus::Report {
                    session_id: view.subscription.session_id(),
                    present: state.present,
                    connection_lost: state.connection_lost,
                    assessment: state.assessment.clone(),
                    review,
                }
            }
        }
    }

    /// Leave the open view when the server signs us out.
    pub async fn watch_sign_out(self: Arc<Self>, mut events: broadcast::Receiver<UiEvent>) {
        loop {
            match events.recv().await {
                Ok(UiEvent::SignedOut) => self.leave(),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Tear down the current view and start a new activation.
    fn navigate(&self) -> Activation {
        let mut current = lock(&self.current);
        current.take();
        self.svc.feed.cancel();
        self.svc.ctx.teardown(ReleaseTrigger::Navigation);
        self.svc.ctx.activate()
    }

    fn install(&self, activation: &Activation, view: View) -> Result<(), ViewError> {
        let mut current = lock(&self.current);
        if !activation.is_live() {
            if let View::Report(report) = &view {
                report.subscription.cancel();
            }
            return Err(ViewError::Superseded);
        }
        *current = Some(view);
        Ok(())
    }

    fn current(&self) -> Option<View> {
        lock(&self.current).clone()
    }

    fn enrollment(&self) -> Result<Arc<EnrollmentView>, ViewError> {
        match self.current() {
            Some(View::Enrollment(view)) => Ok(view),
            _ => Err(ViewError::NotOpen("enrollment")),
        }
    }

    /// Acquire the camera for `activation` and start its presence gate.
    async fn open_camera(&self, activation: &Activation, pipeline: Arc<CapturePipeline>) -> Result<LiveCamera, ViewError> {
        let acquired = self.svc.engine.acquire(self.svc.config.constraints()).await;
        if !activation.is_live() {
            if let Ok(stream) = &acquired {
                self.svc.ctx.registry().release(stream, ReleaseTrigger::Navigation);
            }
            return Err(ViewError::Superseded);
        }
        let stream = acquired.inspect_err(|e| {
            tracing::warn!(error = %e, "camera unavailable");
            self.svc.notifier.toast(ToastLevel::Error, camera_message(e));
        })?;

        let (gate, _) = spawn_gate(
            self.svc.engine.clone(),
            self.svc.config.thresholds(),
            self.svc.config.frame_interval(),
            activation.clone(),
        );
        Ok(LiveCamera { pipeline, gate, stream })
    }

    fn report_capture_error(&self, error: &CaptureError) {
        let message = match error {
            CaptureError::NotReady(reason) => reason.guidance().to_string(),
            CaptureError::Closed => "Attendance Session Closed".to_string(),
            CaptureError::Incomplete { need, .. } => format!("Capture {need} samples first"),
            CaptureError::QuotaReached(quota) => format!("Already captured {quota} samples"),
            CaptureError::Engine(_) => "Capture failed".to_string(),
            CaptureError::Submit(ApiError::Rejected(message)) => message.clone(),
            // Busy: the running action reports for itself. Other API errors
            // were already surfaced by the client.
            CaptureError::Busy | CaptureError::Submit(_) => return,
        };
        self.svc.notifier.toast(ToastLevel::Error, message);
    }
}

fn camera_message(error: &EngineError) -> &'static str {
    match error {
        EngineError::Camera(DeviceError::PermissionDenied(_)) => "Camera permission denied",
        EngineError::Camera(DeviceError::DeviceNotFound(_)) => "No camera found",
        EngineError::Camera(DeviceError::DeviceBusy) => "Camera is in use by another application",
        _ => "Camera initialization failed",
    }
}

/// Fold live feed events into a report until the subscription ends.
async fn apply_feed(
    session_id: i64,
    mut events: mpsc::UnboundedReceiver<FeedEvent>,
    state: Arc<Mutex<ReportState>>,
    notifier: Notifier,
) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Arrivals(arrivals) => {
                let added = lock(&state).append(arrivals);
                tracing::debug!(session_id, added, "report updated");
            }
            FeedEvent::PresentCount(count) => {
                let mut state = lock(&state);
                state.present = state.present.max(count);
            }
            FeedEvent::Notification { message: Some(message), .. } => notifier.toast(ToastLevel::Success, message),
            FeedEvent::Notification { message: None, .. } => {}
            FeedEvent::ConnectionLost => {
                lock(&state).connection_lost = true;
                notifier.toast(ToastLevel::Error, "Live connection lost");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
