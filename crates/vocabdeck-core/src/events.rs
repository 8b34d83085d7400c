//! In-process publish/subscribe for session lifecycle signals.
//!
//! The HTTP layer publishes `AuthEvent::SessionExpired` when the server
//! rejects the held credential; the session manager subscribes and
//! clears its state. The bus is an owned value: clone the handle to share
//! it between publishers and subscribers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

/// Lifecycle signals carried by the bus. None of them carry a payload;
/// handlers re-query state if they need details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthEvent {
    SessionExpired,
}

impl AuthEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEvent::SessionExpired => "session-expired",
        }
    }
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Handler = Arc<dyn Fn() + Send + Sync>;

/// Handle identifying exactly one registration made by `EventBus::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: AuthEvent,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> AuthEvent {
        self.event
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<AuthEvent, Vec<(u64, Handler)>>,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Handlers never run under the lock, so a poisoned registry is still consistent.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler. Handlers for the same event run in registration order.
    pub fn subscribe<F>(&self, event: AuthEvent, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(event = %event, id, "Handler subscribed");
        Subscription { event, id }
    }

    /// Remove the registration identified by `subscription`.
    /// Returns false (and does nothing) if it was not registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut registry = self.registry();
        let Some(handlers) = registry.handlers.get_mut(&subscription.event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.handlers.remove(&subscription.event);
        }
        if removed {
            debug!(event = %subscription.event, id = subscription.id, "Handler unsubscribed");
        }
        removed
    }

    /// Invoke every handler currently registered for `event`, synchronously and
    /// in registration order. A panicking handler is logged and skipped; the
    /// remaining handlers still run. Returns the number of handlers invoked.
    pub fn emit(&self, event: AuthEvent) -> usize {
        let snapshot: Vec<(u64, Handler)> = self
            .registry()
            .handlers
            .get(&event)
            .cloned()
            .unwrap_or_default();

        debug!(event = %event, handlers = snapshot.len(), "Emitting event");
        for (id, handler) in &snapshot {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler())) {
                error!(
                    event = %event,
                    id,
                    panic = %panic_message(payload.as_ref()),
                    "Event handler panicked"
                );
            }
        }
        snapshot.len()
    }

    pub fn handler_count(&self, event: AuthEvent) -> usize {
        self.registry().handlers.get(&event).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry();
        let counts: HashMap<&'static str, usize> = registry
            .handlers
            .iter()
            .map(|(event, handlers)| (event.as_str(), handlers.len()))
            .collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
