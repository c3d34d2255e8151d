//! Background staleness watching for cached datasets
//!
//! The `RefreshCoordinator` polls each watched dataset's origin for a newer
//! modification time and fans the change out to registered callbacks.

pub mod config;
pub mod coordinator;
pub mod rebuild;
pub mod subscriber;

use thiserror::Error;

pub use config::WatchConfig;
pub use coordinator::RefreshCoordinator;
pub use rebuild::rebuild_on_change;
pub use subscriber::{CallbackOutcome, ChangeCallback, SubscriberId};

/// Errors from the refresh coordinator
#[derive(Error, Debug)]
pub enum SyncError {
    /// `cleanup` already ran; no new watches are accepted
    #[error("refresh coordinator is shut down")]
    Closed,

    #[error("no async runtime available: {0}")]
    Runtime(String),
}
