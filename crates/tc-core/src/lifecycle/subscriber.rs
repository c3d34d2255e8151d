//! Lifecycle observer trait

use super::LifecycleState;

/// Trait for components that react to the host moving to/from the foreground
pub trait LifecycleObserver: Send + Sync {
    /// Called when the host lifecycle state changes
    fn on_lifecycle_change(&self, state: LifecycleState);
}
