//! Error taxonomy shared by every table reader and the cache layer

use thiserror::Error;

/// Errors that can occur while reading tables or maintaining their caches
#[derive(Error, Debug)]
pub enum TableError {
    /// The origin table/sheet, or a mandatory cache file, does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Bytes do not match the expected container format
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A cache page (or the whole cache) failed to decode
    #[error("corrupted cache: {0}")]
    Corrupted(String),

    /// A file or the cache total is over its size budget
    #[error("size exceeded: {what} is {size} bytes (limit {limit})")]
    SizeExceeded { what: String, size: u64, limit: u64 },

    /// The reader was used in a state it cannot serve
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The cache was rebuilt after this reader was opened
    #[error("cache for '{0}' was rebuilt while the reader was open")]
    Stale(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task panicked or was cancelled
    #[error("background task failed: {0}")]
    Join(String),
}

impl TableError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, TableError::Io(_) | TableError::Stale(_) | TableError::Join(_))
    }
}

/// Result alias used throughout the workspace
pub type TableResult<T> = Result<T, TableError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let err: TableError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(err.is_transient());
        assert!(!TableError::NotFound("Sheet1".into()).is_transient());
    }

    #[test]
    fn size_exceeded_message_names_the_file() {
        let err = TableError::SizeExceeded {
            what: "book.xlsx".into(),
            size: 10,
            limit: 5,
        };
        assert_eq!(err.to_string(), "size exceeded: book.xlsx is 10 bytes (limit 5)");
    }
}
