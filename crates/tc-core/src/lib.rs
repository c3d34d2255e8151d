//! Core functionality for the table paging cache
//!
//! This crate provides the fundamental abstractions shared by the readers,
//! the cache layer and the refresh watcher: dataset identity, the row data
//! model, the `TableReader` capability, origin access and the error taxonomy.

pub mod dataset;
pub mod error;
pub mod lifecycle;
pub mod source;
pub mod table;

// Re-export commonly used types
pub use dataset::Dataset;
pub use error::{TableError, TableResult};
pub use lifecycle::{LifecycleNotifier, LifecycleObserver, LifecycleState};
pub use source::{ContentSource, SourceMetadata};
pub use table::{ColumnWidths, Headers, RowRecord, TableReader};
