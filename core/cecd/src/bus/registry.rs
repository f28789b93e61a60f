//! Callback registration table.
//!
//! One handler per category. Registering again replaces the previous handler
//! instead of stacking a second one, and handlers are looked up at delivery
//! time, so a replaced handler is never called again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::{BusNotification, EventCategory};

pub type Handler = Arc<dyn Fn(&BusNotification) + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<EventCategory, Registration>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when an existing handler was replaced.
    pub fn register<F>(&self, category: EventCategory, handler: F) -> bool
    where
        F: Fn(&BusNotification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            handler: Arc::new(handler),
        };
        let previous = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category, registration);

        if let Some(previous) = &previous {
            debug!(?category, replaced = previous.id, id, "Bus handler replaced");
        }
        previous.is_some()
    }

    /// Delivers to the current handler, if any. The table lock is released
    /// before the handler runs, so handlers may re-register.
    pub fn dispatch(&self, notification: &BusNotification) -> bool {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&notification.category())
            .map(|registration| Arc::clone(&registration.handler));

        match handler {
            Some(handler) => {
                handler(notification);
                true
            }
            None => false,
        }
    }
}
