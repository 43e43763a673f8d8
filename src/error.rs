use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("table full: no free or matching bucket for key {key} after {probes} probes")]
    TableFull { key: i64, probes: usize },

    #[error("key not found: {key}")]
    KeyNotFound { key: i64 },

    #[error("bucket {slot} still claimed after {spins} waits while probing key {key}")]
    ContentionTimeout { key: i64, slot: usize, spins: u32 },

    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{tables} tables but {batches} import batches")]
    BatchCountMismatch { tables: usize, batches: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TableError>;

/// Checks a caller buffer length against the length implied by the batch.
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(TableError::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
