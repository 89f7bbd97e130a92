//! Presence gate loop: classify the live camera once per frame interval.

use crate::context::Activation;
use crate::engine::EngineHandle;
use attendant_core::{DetectionResult, GateThresholds, RejectReason};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Latest gate verdict as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateStatus {
    pub ready: bool,
    pub guidance: String,
    pub result: DetectionResult,
}

impl From<DetectionResult> for GateStatus {
    fn from(result: DetectionResult) -> Self {
        Self {
            ready: result.is_accepted(),
            guidance: result.guidance().to_string(),
            result,
        }
    }
}

impl Default for GateStatus {
    fn default() -> Self {
        DetectionResult::rejected(RejectReason::Initializing).into()
    }
}

/// Start the gate for one view activation.
///
/// Ticks run strictly one after another: the next probe is scheduled only
/// after the previous one finished. A failed probe shows "initializing".
/// The loop keeps going through transient read errors and ends when the
/// activation dies or a probe fails because the camera was released.
pub fn spawn_gate(
    engine: EngineHandle,
    thresholds: GateThresholds,
    interval: Duration,
    activation: Activation,
) -> (watch::Receiver<GateStatus>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(GateStatus::default());
    let handle = tokio::spawn(gate_loop(engine, thresholds, interval, activation, tx));
    (rx, handle)
}

async fn gate_loop(
    engine: EngineHandle,
    thresholds: GateThresholds,
    interval: Duration,
    activation: Activation,
    tx: watch::Sender<GateStatus>,
) {
    tracing::debug!(generation = activation.generation(), "presence gate started");
    let mut ticks: u64 = 0;

    while activation.is_live() {
        let probe = tokio::select! {
            _ = activation.destroyed() => break,
            probe = engine.probe(thresholds) => probe,
        };
        if !activation.is_live() {
            break;
        }

        let (result, released) = match probe {
            Ok(result) => (result, false),
            Err(e) => {
                let released = !engine.camera().is_active();
                tracing::debug!(error = %e, released, "gate probe failed");
                (DetectionResult::rejected(RejectReason::Initializing), released)
            }
        };
        tx.send_if_modified(|current| {
            let next = GateStatus::from(result);
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        ticks += 1;
        if released {
            break;
        }

        tokio::select! {
            _ = activation.destroyed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::debug!(generation = activation.generation(), ticks, "presence gate stopped");
}
