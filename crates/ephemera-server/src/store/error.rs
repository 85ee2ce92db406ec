use thiserror::Error;

/// Errors surfaced by the secret store and its backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Combined key is not 16, 24 or 32 bytes. A deployment defect, not a
    /// per-request condition.
    #[error("invalid key length: {0} bytes (expected 16, 24 or 32)")]
    InvalidKeyLength(usize),

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("secret not found")]
    NotFound,

    /// Wrong token, truncated or tampered ciphertext. Deliberately carries no
    /// detail about which.
    #[error("secret could not be authenticated")]
    AuthenticationFailure,

    #[error("encryption failed")]
    Encryption,

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("could not allocate a unique id after {0} attempts")]
    IdSpaceExhausted(usize),

    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("record codec error: {0}")]
    Codec(String),
}

impl StoreError {
    /// True for outcomes a caller must not be able to tell apart: an unknown
    /// id and a token that fails to open the record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound | Self::AuthenticationFailure)
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Storage(e.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        Self::Storage(e.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(e.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        Self::Storage(e.into())
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Codec(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_and_auth_failure_are_indistinguishable() {
        assert!(StoreError::NotFound.is_not_found());
        assert!(StoreError::AuthenticationFailure.is_not_found());
        assert!(!StoreError::BackendUnavailable("locked".into()).is_not_found());
        assert!(!StoreError::InvalidKeyLength(7).is_not_found());
    }
}
