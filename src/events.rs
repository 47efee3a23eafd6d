//! Typed event subscriptions for capture strategies.
//!
//! Handlers are registered with [`EventEmitter::subscribe`] and stay registered
//! for as long as the returned [`Subscription`] lives. Emission snapshots the
//! handler list first, so a handler may subscribe, unsubscribe or tear down the
//! emitting component without deadlocking.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::capture::CaptureResult;
use crate::error::CaptureError;

/// Why a recording ended without an explicit `stop()` from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    SilenceTimeout,
    MaxDuration,
    SpeechEnded,
}

/// Everything a capture strategy reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    RecordingStarted { session_id: String },
    SpeechStarted { at_ms: u64 },
    SpeechEnded { duration_ms: u64 },
    /// Display level in 0..=1 (normalized RMS or speech probability)
    LevelChanged { level: f32 },
    /// A speech segment was too short and has been discarded
    Misfire,
    AutoStopped { reason: StopReason },
    RecordingStopped,
    RecordingComplete(CaptureResult),
    Error(CaptureError),
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(u64, Handler<E>)>>,
}

impl<E> Registry<E> {
    fn remove(&self, id: u64) {
        self.handlers.write().retain(|(handler_id, _)| *handler_id != id);
    }
}

pub struct EventEmitter<E> {
    registry: Arc<Registry<E>>,
}

impl<E: 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.handlers.write().push((id, Arc::new(handler)));

        let registry: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
            })),
        }
    }

    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .registry
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.handlers.read().len()
    }

    /// Drop every handler, including detached ones.
    pub fn clear(&self) {
        self.registry.handlers.write().clear();
    }
}

impl<E: 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

/// Handle for a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the handler immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the handler registered for the lifetime of the emitter.
    pub fn detach(mut self) {
        self.cancel.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
