//! User-facing notifications emitted by the daemon.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UiEvent {
    Toast { level: ToastLevel, message: String },
    /// The server rejected our credentials; every view should stop.
    SignedOut,
    /// The attendance session closed; session lists are stale.
    RefreshSessions,
}

/// Fan-out of [`UiEvent`]s. Cheap to clone; sending never blocks.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<UiEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: UiEvent) {
        // No subscribers is fine: nothing is showing notifications.
        let _ = self.tx.send(event);
    }

    pub fn toast(&self, level: ToastLevel, message: impl Into<String>) {
        self.emit(UiEvent::Toast {
            level,
            message: message.into(),
        });
    }
}

/// Mirror every notification into the log until the notifier is dropped.
pub async fn log_events(mut rx: broadcast::Receiver<UiEvent>) {
    loop {
        match rx.recv().await {
            Ok(UiEvent::Toast { level, message }) => match level {
                ToastLevel::Error => tracing::error!(%message, "toast"),
                ToastLevel::Warning => tracing::warn!(%message, "toast"),
                ToastLevel::Info | ToastLevel::Success => tracing::info!(%message, "toast"),
            },
            Ok(UiEvent::SignedOut) => tracing::warn!("signed out by server"),
            Ok(UiEvent::RefreshSessions) => tracing::info!("session list refresh requested"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "notification log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_toast_reaches_subscribers() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.toast(ToastLevel::Error, "Server unreachable");

        assert_eq!(
            rx.recv().await.unwrap(),
            UiEvent::Toast {
                level: ToastLevel::Error,
                message: "Server unreachable".into()
            }
        );
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let notifier = Notifier::new(1);
        notifier.emit(UiEvent::RefreshSessions);
    }
}
