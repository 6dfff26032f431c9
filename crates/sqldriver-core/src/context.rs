//! Cancellation contexts.
//!
//! A [`Context`] travels with every driver call that may run for a long time.
//! Drivers poll it while the engine is working and abort the current step once
//! it reports an error. Contexts form a tree: a child created with
//! [`Context::with_cancel`] or [`Context::with_timeout`] is done as soon as its
//! parent is.
//!
//! ```rust
//! use sqldriver_core::{Context, ContextError};
//!
//! let (ctx, cancel) = Context::background().with_cancel();
//! assert!(ctx.err().is_none());
//! cancel.cancel();
//! assert_eq!(ctx.err(), Some(ContextError::Cancelled));
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// [`CancelHandle::cancel`] was called on this context or an ancestor.
    Cancelled,
    /// The deadline of this context or an ancestor has passed.
    DeadlineExceeded,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Cancelled => write!(f, "context canceled"),
            ContextError::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl std::error::Error for ContextError {}

#[derive(Debug, Default)]
struct CancelFlag {
    cancelled: AtomicBool,
}

/// A cancellation scope.
///
/// Cloning is cheap; clones observe the same cancellation state.
#[derive(Debug, Clone, Default)]
pub struct Context {
    flag: Option<Arc<CancelFlag>>,
    deadline: Option<Instant>,
    parent: Option<Arc<Context>>,
}

impl Context {
    /// The root context. It is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child context together with the handle that cancels it.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let flag = Arc::new(CancelFlag::default());
        let ctx = Context {
            flag: Some(Arc::clone(&flag)),
            deadline: None,
            parent: self.as_parent(),
        };
        (ctx, CancelHandle { flag })
    }

    /// Derive a child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        Context {
            flag: None,
            deadline: Some(deadline),
            parent: self.as_parent(),
        }
    }

    fn as_parent(&self) -> Option<Arc<Context>> {
        if self.can_be_done() {
            Some(Arc::new(self.clone()))
        } else {
            None
        }
    }

    /// Poll the context now.
    ///
    /// Returns `None` while the context is live.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(flag) = &self.flag {
            if flag.cancelled.load(Ordering::Acquire) {
                return Some(ContextError::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(ContextError::DeadlineExceeded);
            }
        }
        self.parent.as_ref().and_then(|p| p.err())
    }

    /// Shorthand for `self.err().is_some()`.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Whether this context could ever report an error.
    ///
    /// Drivers use this to skip installing polling hooks for the background
    /// context.
    pub fn can_be_done(&self) -> bool {
        self.flag.is_some() || self.deadline.is_some() || self.parent.is_some()
    }

    /// The earliest deadline along the parent chain.
    pub fn deadline(&self) -> Option<Instant> {
        let parent = self.parent.as_ref().and_then(|p| p.deadline());
        match (self.deadline, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Cancels the context it was created with (and all of its children).
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<CancelFlag>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.cancelled.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_never_done() {
        let ctx = Context::background();
        assert!(!ctx.can_be_done());
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let (parent, cancel) = Context::background().with_cancel();
        let child = parent.with_timeout(Duration::from_secs(3600));
        let (grandchild, _) = child.with_cancel();

        assert!(!grandchild.is_done());
        cancel.cancel();
        assert!(cancel.is_cancelled());
        assert_eq!(parent.err(), Some(ContextError::Cancelled));
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert_eq!(grandchild.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let (parent, _parent_cancel) = Context::background().with_cancel();
        let (child, child_cancel) = parent.with_cancel();
        child_cancel.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[test]
    fn test_deadline_exceeded() {
        let ctx = Context::background().with_deadline(Instant::now());
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));

        let live = Context::background().with_timeout(Duration::from_secs(3600));
        assert!(live.err().is_none());
        assert!(live.can_be_done());
    }

    #[test]
    fn test_deadline_is_earliest_in_chain() {
        let now = Instant::now();
        let outer = Context::background().with_deadline(now + Duration::from_secs(10));
        let inner = outer.with_deadline(now + Duration::from_secs(20));
        assert_eq!(inner.deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ContextError::Cancelled.to_string(), "context canceled");
        assert_eq!(
            ContextError::DeadlineExceeded.to_string(),
            "context deadline exceeded"
        );
    }
}
