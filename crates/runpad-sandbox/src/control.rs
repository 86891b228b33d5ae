//! Shared control state for one execution context.
//!
//! A [`ContextControl`] is created when a request is bound and shared between
//! the supervising side and the execution unit running the request. Event
//! delivery and destruction take the same lock, so once [`ContextControl::destroy`]
//! returns no further event from that context can reach a receiver.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use deno_core::v8;
use tokio::sync::mpsc::UnboundedSender;

use crate::event::{ContextId, CorrelationId, Envelope, OutputEvent};

/// Lifecycle of an execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextState {
    /// Created, not yet running anything.
    Idle,
    /// Running the request with this correlation id.
    Bound(CorrelationId),
    /// The request ran to completion and `done` was emitted.
    Completed,
    /// Torn down from outside before completing.
    Destroyed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Bound(id) => write!(f, "bound({id})"),
            Self::Completed => f.write_str("completed"),
            Self::Destroyed => f.write_str("destroyed"),
        }
    }
}

struct Inner {
    state: ContextState,
    isolate: Option<v8::IsolateHandle>,
}

/// Identity, lifecycle and kill switch of one execution context.
pub struct ContextControl {
    id: ContextId,
    inner: Mutex<Inner>,
}

impl ContextControl {
    /// Create a fresh idle context with a new identity.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::next(),
            inner: Mutex::new(Inner {
                state: ContextState::Idle,
                isolate: None,
            }),
        })
    }

    /// This context's identity.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.lock().state.clone()
    }

    /// Whether the context has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.lock().state == ContextState::Destroyed
    }

    /// `Idle -> Bound`. Returns `false` if the context is not idle.
    pub fn bind(&self, correlation_id: CorrelationId) -> bool {
        let mut inner = self.lock();
        if inner.state != ContextState::Idle {
            return false;
        }
        inner.state = ContextState::Bound(correlation_id);
        true
    }

    /// Register the isolate running this context so it can be terminated.
    ///
    /// Returns `false` if the context was destroyed before the isolate came up;
    /// the caller must then abandon the run.
    pub fn attach_isolate(&self, handle: v8::IsolateHandle) -> bool {
        let mut inner = self.lock();
        if inner.state == ContextState::Destroyed {
            handle.terminate_execution();
            return false;
        }
        inner.isolate = Some(handle);
        true
    }

    /// Forget the isolate handle. Called before the isolate is dropped.
    pub fn detach_isolate(&self) {
        self.lock().isolate = None;
    }

    /// Deliver an event unless the context has been destroyed.
    ///
    /// Returns `false` when the event was dropped.
    pub fn deliver(&self, sink: &UnboundedSender<Envelope>, event: OutputEvent) -> bool {
        let mut inner = self.lock();
        if inner.state == ContextState::Destroyed {
            tracing::trace!(context = %self.id, kind = %event.kind, "dropping event from destroyed context");
            return false;
        }
        let done = event.is_done();
        let delivered = sink
            .send(Envelope {
                context: self.id,
                event,
            })
            .is_ok();
        if done && delivered {
            inner.state = ContextState::Completed;
        }
        delivered
    }

    /// `Bound -> Destroyed`, terminating the isolate if one is attached.
    ///
    /// Returns `false` if the context had already completed or been destroyed.
    pub fn destroy(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            ContextState::Completed | ContextState::Destroyed => false,
            ContextState::Idle | ContextState::Bound(_) => {
                inner.state = ContextState::Destroyed;
                if let Some(handle) = inner.isolate.take() {
                    handle.terminate_execution();
                }
                tracing::debug!(context = %self.id, "execution context destroyed");
                true
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ContextControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextControl")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn new_context_is_idle_with_unique_identity() {
        let a = ContextControl::new();
        let b = ContextControl::new();
        assert_eq!(a.state(), ContextState::Idle);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn bind_only_from_idle() {
        let ctx = ContextControl::new();
        assert!(ctx.bind("r1".into()));
        assert_eq!(ctx.state(), ContextState::Bound("r1".into()));
        assert!(!ctx.bind("r2".into()));
    }

    #[test]
    fn done_delivery_completes_the_context() {
        let ctx = ContextControl::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.bind("r1".into());

        assert!(ctx.deliver(&tx, OutputEvent::log("r1".into(), "hi")));
        assert!(ctx.deliver(&tx, OutputEvent::done("r1".into())));
        assert_eq!(ctx.state(), ContextState::Completed);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.context, ctx.id());
        assert_eq!(first.event.content_str(), "hi");
        assert!(rx.try_recv().unwrap().event.is_done());
    }

    #[test]
    fn destroyed_context_drops_events() {
        let ctx = ContextControl::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.bind("r1".into());

        assert!(ctx.destroy());
        assert!(ctx.is_destroyed());
        assert!(!ctx.deliver(&tx, OutputEvent::log("r1".into(), "late")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn destroy_after_completion_is_a_no_op() {
        let ctx = ContextControl::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        ctx.bind("r1".into());
        ctx.deliver(&tx, OutputEvent::done("r1".into()));

        assert!(!ctx.destroy());
        assert_eq!(ctx.state(), ContextState::Completed);
    }

    #[test]
    fn destroy_is_idempotent() {
        let ctx = ContextControl::new();
        ctx.bind("r1".into());
        assert!(ctx.destroy());
        assert!(!ctx.destroy());
    }

    #[test]
    fn delivery_to_closed_receiver_reports_failure() {
        let ctx = ContextControl::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        ctx.bind("r1".into());
        assert!(!ctx.deliver(&tx, OutputEvent::done("r1".into())));
        // Undelivered `done` does not count as completion.
        assert_eq!(ctx.state(), ContextState::Bound("r1".into()));
    }
}
