//! Context-switch signal
//!
//! Explicit subscription hub for "the viewing context changed" events. The
//! cleanup orchestrator and the preload queue subscribe to it; the host
//! publishes a [`ContextSwitch`] when a book is opened or the viewer closes.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pageview_cache::SessionId;
use tracing::{error, info};

/// Why the viewing context changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// A new book was opened
    BookOpened,

    /// The viewer was closed
    ViewerClosed,
}

/// Context switch payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSwitch {
    /// New active session (`None` when no book is open)
    pub session: Option<SessionId>,

    /// What triggered the switch
    pub reason: SwitchReason,
}

impl ContextSwitch {
    /// Switch to a newly opened book
    pub fn opened(session: SessionId) -> Self {
        Self {
            session: Some(session),
            reason: SwitchReason::BookOpened,
        }
    }

    /// Switch to "no book open"
    pub fn closed() -> Self {
        Self {
            session: None,
            reason: SwitchReason::ViewerClosed,
        }
    }
}

/// Receiver of context switch events
pub trait ContextSwitchListener: Send + Sync {
    /// Called synchronously, in subscription order, for every published switch
    fn on_context_switch(&self, event: &ContextSwitch);
}

/// Subscription handle returned by [`ContextSignal::subscribe`]
pub type SubscriptionId = u64;

/// Context switch subscription hub
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use pageview_cache::SessionId;
/// use pageview_scheduler::{ContextSignal, ContextSwitch, ContextSwitchListener};
///
/// struct Printer;
///
/// impl ContextSwitchListener for Printer {
///     fn on_context_switch(&self, event: &ContextSwitch) {
///         println!("switched to {:?}", event.session);
///     }
/// }
///
/// let signal = ContextSignal::new();
/// signal.subscribe(Arc::new(Printer));
///
/// let notified = signal.publish(ContextSwitch::opened(SessionId::new("book.cbz")));
/// assert_eq!(notified, 1);
/// assert_eq!(signal.current_session(), Some(SessionId::new("book.cbz")));
/// ```
pub struct ContextSignal {
    listeners: Mutex<BTreeMap<SubscriptionId, Arc<dyn ContextSwitchListener>>>,
    current: Mutex<Option<SessionId>>,
    next_id: AtomicU64,
}

impl ContextSignal {
    /// Create a signal with no listeners and no active session
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn listeners(
        &self,
    ) -> MutexGuard<'_, BTreeMap<SubscriptionId, Arc<dyn ContextSwitchListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn ContextSwitchListener>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().insert(id, listener);
        id
    }

    /// Remove a listener; returns `false` if the id was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners().remove(&id).is_some()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Session carried by the last published switch
    pub fn current_session(&self) -> Option<SessionId> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver a switch to every listener in subscription order
    ///
    /// A panicking listener is logged and skipped; the remaining listeners are
    /// still notified. Returns the number of listeners that completed.
    pub fn publish(&self, event: ContextSwitch) -> usize {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = event.session.clone();

        // Listeners may subscribe or publish from their callback
        let listeners: Vec<_> = self
            .listeners()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();

        info!(
            session = ?event.session.as_ref().map(SessionId::as_str),
            reason = ?event.reason,
            listeners = listeners.len(),
            "context switch"
        );

        let mut notified = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_context_switch(&event))) {
                Ok(()) => notified += 1,
                Err(_) => error!(subscription = id, "context switch listener panicked"),
            }
        }
        notified
    }
}

impl Default for ContextSignal {
    fn default() -> Self {
        Self::new()
    }
}
