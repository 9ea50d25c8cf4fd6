//! Ordered fan-out of session events to registered handlers.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

/// Closed set of events a session can deliver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// One inbound response message. Bidirectional methods only.
    Data,
    /// Terminal status, delivered after [`EventKind::Status`].
    End,
    /// Terminal status, delivered first.
    Status,
}

impl EventKind {
    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::End => "end",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handler reference invoked with a borrowed payload.
pub type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct Listeners<P> {
    handlers: HashMap<EventKind, Vec<Handler<P>>>,
    cleared: bool,
}

/// Registry mapping each [`EventKind`] to an ordered list of handlers.
///
/// Clones share the same underlying registry. The internal lock is released
/// while handlers run, so a handler may register more handlers or clear the
/// registry; after [`ListenerRegistry::clear`] no handler runs again, even in
/// the middle of a dispatch.
pub struct ListenerRegistry<P> {
    inner: Arc<Mutex<Listeners<P>>>,
}

impl<P> ListenerRegistry<P> {
    /// Empty registry accepting registrations.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Listeners {
                handlers: HashMap::new(),
                cleared: false,
            })),
        }
    }

    /// Appends `handler` for `kind` and returns `self` for chaining.
    ///
    /// Registrations made after [`ListenerRegistry::clear`] are dropped.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> &Self
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let mut listeners = self.lock();
        if listeners.cleared {
            debug!(event = "listener_dropped_after_clear", kind = kind.as_str());
            return self;
        }
        listeners
            .handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Invokes every handler registered for `kind`, in registration order.
    ///
    /// A panicking handler is logged and skipped. Returns the number of
    /// handlers that were invoked.
    pub fn dispatch(&self, kind: EventKind, payload: &P) -> usize {
        let mut invoked = 0;
        loop {
            let next = {
                let listeners = self.lock();
                if listeners.cleared {
                    break;
                }
                listeners
                    .handlers
                    .get(&kind)
                    .and_then(|handlers| handlers.get(invoked))
                    .cloned()
            };
            let Some(handler) = next else {
                break;
            };

            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                warn!(
                    event = "listener_panicked",
                    kind = kind.as_str(),
                    index = invoked,
                    reason = panic_message(panic.as_ref())
                );
            }
            invoked += 1;
        }
        invoked
    }

    /// Discards every handler of every kind. Idempotent.
    pub fn clear(&self) {
        let mut listeners = self.lock();
        listeners.handlers.clear();
        listeners.cleared = true;
    }

    /// True once [`ListenerRegistry::clear`] has run.
    pub fn is_cleared(&self) -> bool {
        self.lock().cleared
    }

    /// Number of handlers currently registered for `kind`.
    pub fn len(&self, kind: EventKind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, Listeners<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P> Default for ListenerRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for ListenerRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for ListenerRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.lock();
        f.debug_struct("ListenerRegistry")
            .field("data", &listeners.handlers.get(&EventKind::Data).map_or(0, Vec::len))
            .field("end", &listeners.handlers.get(&EventKind::End).map_or(0, Vec::len))
            .field("status", &listeners.handlers.get(&EventKind::Status).map_or(0, Vec::len))
            .field("cleared", &listeners.cleared)
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
