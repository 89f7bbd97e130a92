//! Lifetime of one view activation.
//!
//! Every background loop a view starts holds an [`Activation`]. Tearing the
//! view down bumps the generation and cancels the activation's token, so a
//! loop that checks [`Activation::is_live`] before scheduling and after each
//! await can never act on behalf of a view that is gone.

use attendant_hw::{ReleaseTrigger, StreamRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Long-lived context shared by every view of the daemon.
pub struct ViewContext {
    registry: Arc<StreamRegistry>,
    generation: Arc<AtomicU64>,
    root: CancellationToken,
    current: Mutex<CancellationToken>,
}

/// Handle held by the loops of one view activation.
#[derive(Clone, Debug)]
pub struct Activation {
    generation: u64,
    counter: Arc<AtomicU64>,
    token: CancellationToken,
}

impl Activation {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True while this activation is the current one and was not torn down.
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled() && self.counter.load(Ordering::Acquire) == self.generation
    }

    /// Resolves once the activation has been torn down.
    pub async fn destroyed(&self) {
        self.token.cancelled().await
    }
}

impl ViewContext {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        let root = CancellationToken::new();
        let current = root.child_token();
        Self {
            registry,
            generation: Arc::new(AtomicU64::new(0)),
            root,
            current: Mutex::new(current),
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new activation. Any previous activation stops being live.
    pub fn activate(&self) -> Activation {
        let token = self.root.child_token();
        let previous = std::mem::replace(&mut *self.lock(), token.clone());
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        previous.cancel();
        tracing::debug!(generation, "view activated");
        Activation {
            generation,
            counter: self.generation.clone(),
            token,
        }
    }

    /// Destroy the current activation and force-release every camera stream.
    /// Returns the number of streams stopped.
    pub fn teardown(&self, trigger: ReleaseTrigger) -> usize {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.lock().cancel();
        let released = self.registry.release_all(trigger);
        tracing::debug!(generation, %trigger, released, "view torn down");
        released
    }

    /// Host hidden: cameras go off, the view itself stays.
    pub fn hide(&self) -> usize {
        self.registry.release_all(ReleaseTrigger::Hidden)
    }

    /// Daemon exit: cancel everything ever derived from this context.
    pub fn shutdown(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.root.cancel();
        self.registry.release_all(ReleaseTrigger::Unload)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_invalidates_previous() {
        let ctx = ViewContext::new(Arc::new(StreamRegistry::new()));
        let first = ctx.activate();
        assert!(first.is_live());

        let second = ctx.activate();
        assert!(!first.is_live());
        assert!(first.token().is_cancelled());
        assert!(second.is_live());
        assert!(second.generation() > first.generation());
    }

    #[test]
    fn test_teardown_kills_activation() {
        let ctx = ViewContext::new(Arc::new(StreamRegistry::new()));
        let view = ctx.activate();
        ctx.teardown(ReleaseTrigger::Navigation);
        assert!(!view.is_live());
        // Repeated teardown is harmless.
        assert_eq!(ctx.teardown(ReleaseTrigger::Navigation), 0);
    }

    #[test]
    fn test_hide_keeps_activation() {
        let ctx = ViewContext::new(Arc::new(StreamRegistry::new()));
        let view = ctx.activate();
        ctx.hide();
        assert!(view.is_live());
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let ctx = ViewContext::new(Arc::new(StreamRegistry::new()));
        let view = ctx.activate();
        ctx.shutdown();
        assert!(!view.is_live());
        assert!(ctx.activate().token().is_cancelled());
    }

    #[tokio::test]
    async fn test_destroyed_resolves_on_teardown() {
        let ctx = ViewContext::new(Arc::new(StreamRegistry::new()));
        let view = ctx.activate();
        let waiter = tokio::spawn({
            let view = view.clone();
            async move { view.destroyed().await }
        });
        ctx.teardown(ReleaseTrigger::Explicit);
        waiter.await.unwrap();
    }
}
