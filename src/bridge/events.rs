//! In-process event bus for telemetry and acknowledgement fan-out
//!
//! Handlers run synchronously on the publishing task, in registration order.
//! The registry lock is released before any handler runs, so a handler may
//! unsubscribe itself (or anyone else) from inside its own invocation. A
//! handler that errors or panics is logged and skipped; delivery to the
//! remaining handlers continues.

use crate::model::{Acknowledgement, TelemetryReading};
use color_eyre::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error};

type Handler<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

struct Listener<T> {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler<T>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: self.active.clone(),
            handler: self.handler.clone(),
        }
    }
}

struct Registry<T> {
    kind: &'static str,
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T: Send + Sync + 'static> Registry<T> {
    fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        })
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener<T>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(self: &Arc<Self>, handler: Handler<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.listeners().push(Listener {
            id,
            active: active.clone(),
            handler,
        });
        debug!("Registered {} listener {}", self.kind, id);

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription {
            cancel: Some(Box::new(move || {
                active.store(false, Ordering::SeqCst);
                if let Some(registry) = registry.upgrade() {
                    registry.listeners().retain(|listener| listener.id != id);
                    debug!("Removed {} listener {}", registry.kind, id);
                }
            })),
        }
    }

    fn publish(&self, event: &T) {
        let listeners: Vec<Listener<T>> = self.listeners().clone();

        for listener in listeners {
            if !listener.active.load(Ordering::SeqCst) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (listener.handler)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} listener {} failed: {}", self.kind, listener.id, e),
                Err(_) => error!("{} listener {} panicked", self.kind, listener.id),
            }
        }
    }
}

/// Handle returned by a subscribe call.
///
/// Dropping it unsubscribes; `unsubscribe` may be called any number of times.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Fan-out of decoded device events to any number of observers
pub struct EventBus {
    telemetry: Arc<Registry<TelemetryReading>>,
    acks: Arc<Registry<Acknowledgement>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            telemetry: Registry::new("telemetry"),
            acks: Registry::new("ack"),
        }
    }

    pub fn subscribe_telemetry<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TelemetryReading) -> Result<()> + Send + Sync + 'static,
    {
        self.telemetry.subscribe(Arc::new(handler))
    }

    pub fn subscribe_ack<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Acknowledgement) -> Result<()> + Send + Sync + 'static,
    {
        self.acks.subscribe(Arc::new(handler))
    }

    pub fn publish_telemetry(&self, reading: &TelemetryReading) {
        self.telemetry.publish(reading);
    }

    pub fn publish_ack(&self, ack: &Acknowledgement) {
        self.acks.publish(ack);
    }

    pub fn telemetry_subscribers(&self) -> usize {
        self.telemetry.listeners().len()
    }

    pub fn ack_subscribers(&self) -> usize {
        self.acks.listeners().len()
    }
}
