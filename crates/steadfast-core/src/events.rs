//! Typed event system shared by every pattern.
//!
//! Each pattern crate defines its own event enum (state transitions,
//! admissions, rejections, ...) and emits through an [`EventListeners`]
//! collection. Listener panics are isolated so a misbehaving observer can
//! never take a resilience primitive down with it.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// An event emitted by a pattern instance.
pub trait PatternEvent: Send + Sync + fmt::Debug {
    /// Short event discriminator, e.g. `"state_transition"`.
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn timestamp(&self) -> Instant;

    /// Name of the pattern instance that emitted the event.
    fn pattern_name(&self) -> &str;
}

/// An observer of pattern events.
pub trait EventListener<E: PatternEvent>: Send + Sync {
    fn on_event(&self, event: &E);
}

/// Shared handle to a listener.
pub type BoxedEventListener<E> = Arc<dyn EventListener<E>>;

/// An ordered collection of listeners for one event type.
#[derive(Clone)]
pub struct EventListeners<E: PatternEvent> {
    listeners: Vec<BoxedEventListener<E>>,
}

impl<E: PatternEvent + 'static> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Register a listener. Listeners fire in registration order.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Register a plain closure as a listener.
    pub fn add_fn<F>(&mut self, f: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(FnListener::new(f));
    }

    /// Emit to every listener, isolating panics.
    ///
    /// A panicking listener is logged and counted; the remaining listeners
    /// still run.
    pub fn emit(&self, event: &E) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));

            if result.is_err() {
                tracing::warn!(
                    listener_index = index,
                    pattern = event.pattern_name(),
                    event_type = event.event_type(),
                    "event listener panicked"
                );

                #[cfg(feature = "metrics")]
                metrics::counter!(
                    "steadfast_event_listener_panics_total",
                    "pattern" => event.pattern_name().to_string(),
                    "event_type" => event.event_type().to_string()
                )
                .increment(1);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: PatternEvent + 'static> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A closure-backed listener.
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _marker: std::marker::PhantomData<fn(&E)>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: PatternEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}
