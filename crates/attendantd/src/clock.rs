//! Drives a [`SessionClock`] once per second for an attendance view.

use crate::context::Activation;
use crate::events::{Notifier, ToastLevel, UiEvent};
use attendant_core::clock;
use attendant_core::{ClockEvent, ClockState, SessionClock};
use attendant_hw::{CameraSession, ReleaseTrigger};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const TICK: Duration = Duration::from_secs(1);
/// Delay between closure and the session-list refresh.
pub const REFRESH_DELAY: Duration = Duration::from_millis(1500);

/// Source of wall-clock time. One sample is taken per tick.
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockStatus {
    pub session_id: i64,
    pub state: ClockState,
    pub text: String,
}

/// What closing the session switches off.
pub struct CloseActions {
    pub camera: Arc<CameraSession>,
    pub capture_enabled: Arc<AtomicBool>,
    pub notifier: Notifier,
}

impl CloseActions {
    fn run(&self) {
        self.capture_enabled.store(false, Ordering::Release);
        self.camera.release(ReleaseTrigger::SessionClosed);
        self.notifier.toast(ToastLevel::Info, "Attendance Session Closed");
    }
}

pub fn spawn_clock(
    session: SessionClock,
    wall: Arc<dyn WallClock>,
    actions: CloseActions,
    activation: Activation,
) -> (watch::Receiver<ClockStatus>, JoinHandle<()>) {
    let now = wall.now();
    let window = session.window();
    let initial = ClockStatus {
        session_id: window.session_id,
        state: clock::transition(now, window.end_time, session.grace()),
        text: clock::status_text(now, window.end_time, session.grace()),
    };
    let (tx, rx) = watch::channel(initial);
    let handle = tokio::spawn(clock_loop(session, wall, actions, activation, tx));
    (rx, handle)
}

async fn clock_loop(
    mut session: SessionClock,
    wall: Arc<dyn WallClock>,
    actions: CloseActions,
    activation: Activation,
    tx: watch::Sender<ClockStatus>,
) {
    let session_id = session.window().session_id;
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'ticks: loop {
        tokio::select! {
            _ = activation.destroyed() => return,
            _ = ticker.tick() => {}
        }
        if !activation.is_live() {
            return;
        }

        let now = wall.now();
        let events = session.advance(now);
        tx.send_replace(ClockStatus {
            session_id,
            state: session.state(),
            text: session.status_text(now),
        });

        for event in events {
            match event {
                ClockEvent::EnteredClosing => {
                    tracing::info!(session_id, "attendance session in grace period");
                }
                ClockEvent::EnteredClosed => {
                    tracing::info!(session_id, "attendance session closed");
                    actions.run();
                    break 'ticks;
                }
            }
        }
    }

    tokio::select! {
        _ = activation.destroyed() => {}
        _ = tokio::time::sleep(REFRESH_DELAY) => {
            if activation.is_live() {
                actions.notifier.emit(UiEvent::RefreshSessions);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ViewContext;
    use crate::test_support::{AnchoredClock, FakeCamera};
    use attendant_core::SessionWindow;
    use attendant_hw::CameraConstraints;

    struct Rig {
        camera: FakeCamera,
        ctx: ViewContext,
        enabled: Arc<AtomicBool>,
        notifier: Notifier,
    }

    fn rig() -> Rig {
        let camera = FakeCamera::new(64, 48);
        camera.session().acquire(&CameraConstraints::default()).unwrap();
        let ctx = ViewContext::new(camera.registry.clone());
        Rig {
            camera,
            ctx,
            enabled: Arc::new(AtomicBool::new(true)),
            notifier: Notifier::new(16),
        }
    }

    fn start(rig: &Rig, ends_in: chrono::Duration) -> (watch::Receiver<ClockStatus>, JoinHandle<()>) {
        let wall = Utc::now();
        let window = SessionWindow {
            session_id: 7,
            start_time: wall,
            end_time: wall + ends_in,
        };
        let actions = CloseActions {
            camera: rig.camera.session(),
            capture_enabled: rig.enabled.clone(),
            notifier: rig.notifier.clone(),
        };
        spawn_clock(
            SessionClock::new(window, chrono::Duration::seconds(30)),
            Arc::new(AnchoredClock::new(wall)),
            actions,
            rig.ctx.activate(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_closes_after_grace() {
        let rig = rig();
        let mut events = rig.notifier.subscribe();
        let (rx, task) = start(&rig, chrono::Duration::seconds(2));

        assert_eq!(rx.borrow().state, ClockState::Active);
        assert_eq!(rx.borrow().text, "Attendance closes in 0:02");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(rx.borrow().text, "Attendance closes in 0:01");

        // The tick at the end time itself starts the full grace countdown.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(rx.borrow().state, ClockState::Closing);
        assert_eq!(rx.borrow().text, "Closing in 30s");
        assert!(rig.enabled.load(Ordering::Acquire));
        assert_eq!(rig.camera.stop_counts(), vec![0]);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(rx.borrow().text, "Closing in 29s");

        tokio::time::sleep(Duration::from_millis(28_000)).await;
        assert_eq!(rx.borrow().text, "Closing in 1s");
        assert!(rig.enabled.load(Ordering::Acquire));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(rx.borrow().state, ClockState::Closed);
        assert_eq!(rx.borrow().text, "Attendance Session Closed");
        assert!(!rig.enabled.load(Ordering::Acquire));
        assert_eq!(rig.camera.stop_counts(), vec![1]);

        tokio::time::sleep(REFRESH_DELAY).await;
        task.await.unwrap();
        let mut refreshed = 0;
        while let Ok(event) = events.try_recv() {
            if event == UiEvent::RefreshSessions {
                refreshed += 1;
            }
        }
        assert_eq!(refreshed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_closed_session_closes_on_first_tick() {
        let rig = rig();
        let (rx, _task) = start(&rig, chrono::Duration::seconds(-60));
        assert_eq!(rx.borrow().state, ClockState::Closed);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!rig.enabled.load(Ordering::Acquire));
        assert_eq!(rig.camera.stop_counts(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_clock_and_refresh() {
        let rig = rig();
        let mut events = rig.notifier.subscribe();
        let (_rx, task) = start(&rig, chrono::Duration::seconds(-60));

        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.ctx.teardown(ReleaseTrigger::Navigation);
        task.await.unwrap();

        tokio::time::sleep(REFRESH_DELAY * 2).await;
        while let Ok(event) = events.try_recv() {
            assert_ne!(event, UiEvent::RefreshSessions);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_session_keeps_camera() {
        let rig = rig();
        let (rx, _task) = start(&rig, chrono::Duration::minutes(5));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.borrow().state, ClockState::Active);
        assert!(rx.borrow().text.starts_with("Attendance closes in 4:"));
        assert_eq!(rig.camera.stop_counts(), vec![0]);
    }
}
