//! Process-wide services the orchestrator consults: the cooperative
//! interrupt query and the memory-reclamation hook.
//!
//! Both are injected into [`Orchestrator`](crate::Orchestrator) at
//! construction instead of being looked up globally, so tests can count
//! exactly how often each one is touched.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::BoxError;

/// Polled interrupt query: has the user asked for this run to stop?
pub trait CancellationSignal {
    /// Whether an interrupt is pending.
    fn is_interrupted(&self) -> bool;
}

impl<T: CancellationSignal + ?Sized> CancellationSignal for &T {
    fn is_interrupted(&self) -> bool {
        (**self).is_interrupted()
    }
}

/// A signal that is never raised.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverInterrupted;

impl CancellationSignal for NeverInterrupted {
    fn is_interrupted(&self) -> bool {
        false
    }
}

/// Shared interrupt flag.
///
/// Clones share the same flag, so one clone can be handed to a Ctrl-C
/// handler or another thread while the orchestrator polls another.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// A lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Withdraw a pending interrupt request.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether an interrupt has been requested.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl CancellationSignal for InterruptFlag {
    fn is_interrupted(&self) -> bool {
        self.is_raised()
    }
}

/// Releases accelerator and host memory caches.
pub trait ResourceReclaimer {
    /// Release caches now.
    ///
    /// # Errors
    ///
    /// Failures are logged by [`ReclaimGuard`] and otherwise ignored.
    fn reclaim(&self) -> Result<(), BoxError>;
}

impl<T: ResourceReclaimer + ?Sized> ResourceReclaimer for &T {
    fn reclaim(&self) -> Result<(), BoxError> {
        (**self).reclaim()
    }
}

/// A reclaimer with nothing to release.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReclaimer;

impl ResourceReclaimer for NoopReclaimer {
    fn reclaim(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Adapts a closure into a [`ResourceReclaimer`].
#[derive(Debug, Clone, Copy)]
pub struct FnReclaimer<F>(pub F);

impl<F: Fn() -> Result<(), BoxError>> ResourceReclaimer for FnReclaimer<F> {
    fn reclaim(&self) -> Result<(), BoxError> {
        (self.0)()
    }
}

/// Calls a reclaimer exactly once when dropped.
///
/// Held for the whole body of a run so that reclamation happens on every
/// exit path: normal return, interrupt, stage error, or a panicking stage
/// unwinding through the run. An `Err` from the reclaimer is logged and
/// dropped. A panic from the reclaimer is contained as well, unless the
/// thread is already unwinding, in which case the runtime aborts.
#[must_use = "the reclaimer runs when the guard is dropped"]
pub struct ReclaimGuard<'a, R: ResourceReclaimer + ?Sized> {
    reclaimer: &'a R,
}

impl<'a, R: ResourceReclaimer + ?Sized> ReclaimGuard<'a, R> {
    /// Arm a guard around `reclaimer`.
    pub const fn new(reclaimer: &'a R) -> Self {
        Self { reclaimer }
    }
}

impl<R: ResourceReclaimer + ?Sized> Drop for ReclaimGuard<'_, R> {
    fn drop(&mut self) {
        let reclaimer = self.reclaimer;
        match panic::catch_unwind(AssertUnwindSafe(|| reclaimer.reclaim())) {
            Ok(Ok(())) => tracing::debug!("released cached resources"),
            Ok(Err(error)) => {
                tracing::warn!(%error, "resource reclamation failed; ignoring");
            }
            Err(_) => tracing::warn!("resource reclamation panicked; ignoring"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: Cell<u32>,
    }

    impl ResourceReclaimer for Counting {
        fn reclaim(&self) -> Result<(), BoxError> {
            self.calls.set(self.calls.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn interrupt_flag_clones_share_state() {
        let flag = InterruptFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_interrupted());
        handle.raise();
        assert!(flag.is_interrupted());
        flag.clear();
        assert!(!handle.is_raised());
    }

    #[test]
    fn never_interrupted_stays_lowered() {
        assert!(!NeverInterrupted.is_interrupted());
        assert!(!(&NeverInterrupted).is_interrupted());
    }

    #[test]
    fn guard_reclaims_once_on_drop() {
        let counting = Counting::default();
        {
            let _guard = ReclaimGuard::new(&counting);
            assert_eq!(counting.calls.get(), 0);
        }
        assert_eq!(counting.calls.get(), 1);
    }

    #[test]
    fn guard_reclaims_on_early_return() {
        fn early(counting: &Counting) -> Result<(), &'static str> {
            let _guard = ReclaimGuard::new(counting);
            Err::<(), _>("bail")?;
            Ok(())
        }
        let counting = Counting::default();
        assert_eq!(early(&counting), Err("bail"));
        assert_eq!(counting.calls.get(), 1);
    }

    #[test]
    fn guard_swallows_reclaimer_error() {
        let failing = FnReclaimer(|| Err::<(), BoxError>("device lost".into()));
        drop(ReclaimGuard::new(&failing));
    }

    #[test]
    fn guard_contains_reclaimer_panic() {
        let panicking = FnReclaimer(|| -> Result<(), BoxError> { panic!("allocator gone") });
        drop(ReclaimGuard::new(&panicking));
    }

    #[test]
    fn guard_reclaims_while_unwinding_from_stage_panic() {
        let counting = Counting::default();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = ReclaimGuard::new(&counting);
            panic!("stage exploded");
        }));
        assert!(result.is_err());
        assert_eq!(counting.calls.get(), 1);
    }

    #[test]
    fn noop_reclaimer_succeeds() {
        assert!(NoopReclaimer.reclaim().is_ok());
    }
}
