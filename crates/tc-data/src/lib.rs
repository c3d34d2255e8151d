//! Spreadsheet parsing, paged caches and size budgets
//!
//! `LiveTableReader` parses an origin workbook directly; `CacheManager` turns
//! it into a directory of compressed pages served by `CachedTableReader`.

pub mod cache;
pub mod config;
pub mod guard;
pub mod sources;
pub mod xlsx;

// Re-exports
pub use cache::{CacheManager, CacheManifest, CacheStatus, IntegrityChecker, RebuildOutcome, RebuildReport, StaleReason};
pub use config::{CacheConfig, SizeLimits};
pub use guard::{EvictionReport, FileCategory, SizeGuard};
pub use sources::{CachedTableReader, LayeredContentSource, LiveTableReader, PageDiagnostic, RemoteFetcher};
