//! Typed error kinds for the page store.
//!
//! Fallible operations return `eyre::Result` and attach context the usual way
//! (`ensure!`, `bail!`, `wrap_err_with`). Where a caller must distinguish the
//! failure class — the container-slot protocol, closed-transaction checks,
//! corruption aborts — the report carries a [`StorageError`] at its root so
//! the kind survives propagation and can be recovered with
//! [`StorageError::of`].
//!
//! Absent or tombstoned records are not errors: lookups return `Ok(None)`.

use thiserror::Error;

/// Failure classes surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Caller passed an out-of-domain value (negative key, unknown revision,
    /// a page kind that is not a record subtree).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation violated a protocol the transaction enforces (container
    /// slot already occupied, operation on a closed transaction, second
    /// concurrent write transaction).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An operation required a record that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted bytes failed validation (bad length prefix, unknown kind
    /// tag, checksum mismatch). The owning transaction must be abandoned.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl StorageError {
    /// Recovers the typed kind from an eyre report, if one is attached.
    pub fn of(report: &eyre::Report) -> Option<&StorageError> {
        report.downcast_ref::<StorageError>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn fails_with_state() -> Result<()> {
        eyre::bail!(StorageError::InvalidState("slot occupied".into()))
    }

    #[test]
    fn kind_survives_propagation() {
        let err = fails_with_state()
            .map_err(|e| e.wrap_err("while committing"))
            .unwrap_err();
        assert!(matches!(
            StorageError::of(&err),
            Some(StorageError::InvalidState(_))
        ));
    }
}
