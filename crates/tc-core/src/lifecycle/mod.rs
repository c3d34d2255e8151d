//! Host lifecycle signals
//!
//! The host application (whatever UI framework it uses) reports foreground
//! and background transitions to a `LifecycleNotifier`; background watchers
//! subscribe to it instead of depending on the framework directly.

use std::sync::{Arc, Weak};
use parking_lot::RwLock;

mod subscriber;

pub use subscriber::LifecycleObserver;

/// Foreground/background state of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Visible and interactive; background work may run
    Foreground,
    /// Hidden; background work should idle
    Background,
}

/// Broadcasts lifecycle transitions to weakly-held observers
pub struct LifecycleNotifier {
    state: RwLock<LifecycleState>,
    observers: RwLock<Vec<Weak<dyn LifecycleObserver>>>,
}

impl LifecycleNotifier {
    /// Create a notifier that starts in the foreground
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LifecycleState::Foreground),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Add an observer. It is immediately told the current state.
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        let state = self.state();
        self.observers.write().push(Arc::downgrade(&observer));
        observer.on_lifecycle_change(state);
    }

    /// Record a transition; observers are only notified on actual changes
    pub fn set_state(&self, state: LifecycleState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        tracing::debug!("Lifecycle changed to {:?}", state);
        self.notify_observers(state);
    }

    fn notify_observers(&self, state: LifecycleState) {
        // Upgrade under the lock, call outside it so observers may re-enter
        let live: Vec<Arc<dyn LifecycleObserver>> = {
            let mut observers = self.observers.write();
            observers.retain(|weak| weak.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };

        for observer in live {
            observer.on_lifecycle_change(state);
        }
    }
}

impl Default for LifecycleNotifier {
    fn default() -> Self {
        Self::new()
    }
}
