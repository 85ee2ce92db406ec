use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::id;
use super::model::SecretRecord;

/// Physical storage for sealed records.
///
/// Implementations allocate the id inside the same lock or transaction that
/// inserts the record, remove a record atomically with its time-index entry,
/// and never hand out the same record twice.
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Store `ciphertext` under a freshly allocated id of `id_len` characters.
    fn put(&self, ciphertext: &[u8], created_at: DateTime<Utc>, id_len: usize)
        -> StoreResult<String>;

    /// Remove and return the record for `id`, or `NotFound`.
    fn take(&self, id: &str) -> StoreResult<SecretRecord>;

    /// Delete every record created before `cutoff`. Returns how many went.
    fn sweep_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

/// Process-local backend. One exclusive lock covers every operation, which
/// is what makes id allocation and one-time reads atomic.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, SecretRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn put(
        &self,
        ciphertext: &[u8],
        created_at: DateTime<Utc>,
        id_len: usize,
    ) -> StoreResult<String> {
        // Map operations cannot leave the table half-updated, so a poisoned
        // lock still guards consistent data.
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);

        let id = id::new_id(id_len, |candidate| Ok(records.contains_key(candidate)))?;
        records.insert(
            id.clone(),
            SecretRecord {
                id: id.clone(),
                ciphertext: ciphertext.to_vec(),
                created_at,
            },
        );

        debug!(id = %id, "stored secret in memory");
        Ok(id)
    }

    fn take(&self, id: &str) -> StoreResult<SecretRecord> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(id).ok_or(StoreError::NotFound)
    }

    fn sweep_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| record.created_at >= cutoff);
        Ok(before - records.len())
    }
}
