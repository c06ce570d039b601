//! Coalescing event bus.
//!
//! Triggers of the same kind within the coalescing window collapse into one delivery carrying
//! the last payload. Listeners are always invoked asynchronously, each on its own task, never
//! from within the triggering call.

use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum_macros::Display;

/// Default coalescing window.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(400);

/// Events published by the explorer.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum EventKind {
    CategoriesChanged,
    DatasetsIndexLoaded,
    DatasetsIndexUpdated,
    SelectedYearsChanged,
    Searching,
}

type Listener<E> = Arc<dyn Fn(E) + Send + Sync>;

struct Channels<E> {
    listeners: HashMap<EventKind, Vec<Listener<E>>>,
    generations: HashMap<EventKind, u64>,
}

/// Observer registry with per-kind last-write-wins coalescing.
pub struct EventBus<E> {
    window: Duration,
    channels: Arc<Mutex<Channels<E>>>,
}

impl<E> Default for EventBus<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_WINDOW)
    }
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    pub fn new(window: Duration) -> Self {
        EventBus {
            window,
            channels: Arc::new(Mutex::new(Channels {
                listeners: HashMap::new(),
                generations: HashMap::new(),
            })),
        }
    }

    fn lock(channels: &Mutex<Channels<E>>) -> std::sync::MutexGuard<'_, Channels<E>> {
        match channels.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a listener.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        Self::lock(&self.channels)
            .listeners
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Schedule delivery of an event once the coalescing window has passed without another
    /// trigger of the same kind. Must be called within a Tokio runtime.
    pub fn trigger(&self, kind: EventKind, payload: E) {
        let generation = {
            let mut channels = Self::lock(&self.channels);
            let generation = channels.generations.entry(kind).or_insert(0);
            *generation += 1;
            *generation
        };
        let channels = self.channels.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let listeners = {
                let channels = Self::lock(&channels);
                if channels.generations.get(&kind) != Some(&generation) {
                    return;
                }
                channels.listeners.get(&kind).cloned().unwrap_or_default()
            };
            tracing::trace!("delivering {} to {} listeners", kind, listeners.len());
            for listener in listeners {
                let payload = payload.clone();
                tokio::spawn(async move { listener(payload) });
            }
        });
    }
}
