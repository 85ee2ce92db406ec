use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use zeroize::Zeroizing;

use super::backend::{Backend, MemoryBackend};
use super::crypto;
use super::db::{DurableBackend, DEFAULT_LOCK_TIMEOUT};
use super::error::{StoreError, StoreResult};
use super::id;

pub const DEFAULT_ID_LENGTH: usize = 8;
pub const DEFAULT_TOKEN_LENGTH: usize = 8;

/// Everything the store needs at construction time.
#[derive(Clone)]
pub struct StoreConfig {
    /// Server-side half of every encryption key.
    pub key_part: String,
    /// Durable (redb) backend when true, in-memory otherwise.
    pub persistent: bool,
    /// Directory holding the durable database file.
    pub storage_path: PathBuf,
    pub id_length: usize,
    pub token_length: usize,
    /// How long the durable backend waits for the database file lock.
    pub lock_timeout: Duration,
}

impl StoreConfig {
    /// Volatile store with default id/token lengths.
    pub fn new(key_part: impl Into<String>) -> Self {
        Self {
            key_part: key_part.into(),
            persistent: false,
            storage_path: PathBuf::new(),
            id_length: DEFAULT_ID_LENGTH,
            token_length: DEFAULT_TOKEN_LENGTH,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Durable store rooted at `storage_path`.
    pub fn persistent(key_part: impl Into<String>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            persistent: true,
            storage_path: storage_path.into(),
            ..Self::new(key_part)
        }
    }

    /// Byte length of `key_part || token`.
    pub fn combined_key_len(&self) -> usize {
        self.key_part.len() + self.token_length
    }

    pub fn validate(&self) -> StoreResult<()> {
        let key_len = self.combined_key_len();
        if !crypto::KEY_SIZES.contains(&key_len) {
            return Err(StoreError::InvalidKeyLength(key_len));
        }
        if self.id_length == 0 {
            return Err(StoreError::InvalidConfig("id length must be at least 1".into()));
        }
        if self.persistent && self.storage_path.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig(
                "persistent storage needs a storage path".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("key_part", &"[redacted]")
            .field("persistent", &self.persistent)
            .field("storage_path", &self.storage_path)
            .field("id_length", &self.id_length)
            .field("token_length", &self.token_length)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

/// Thread-safe handle to the secret store.
///
/// Seals payloads under `key_part || token`, hands the record to the active
/// backend, and returns the id and token. The token is never stored, so
/// neither the backend contents nor the token alone can open a secret.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    key_part: Arc<Zeroizing<String>>,
    id_length: usize,
    token_length: usize,
}

impl Store {
    /// Validate `config` and open the backend it selects.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let backend: Arc<dyn Backend> = if config.persistent {
            Arc::new(DurableBackend::open(
                &config.storage_path,
                config.lock_timeout,
            )?)
        } else {
            Arc::new(MemoryBackend::new())
        };
        Self::with_backend(config, backend)
    }

    /// Build a store over an already constructed backend.
    pub fn with_backend(config: &StoreConfig, backend: Arc<dyn Backend>) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            key_part: Arc::new(Zeroizing::new(config.key_part.clone())),
            id_length: config.id_length,
            token_length: config.token_length,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Encrypt and store `plaintext`. Returns `(id, token)`; both are needed
    /// to read it back, once.
    pub fn save(&self, plaintext: &str) -> StoreResult<(String, String)> {
        self.save_at(plaintext, Utc::now())
    }

    pub(crate) fn save_at(
        &self,
        plaintext: &str,
        created_at: DateTime<Utc>,
    ) -> StoreResult<(String, String)> {
        let token = id::new_token(self.token_length);
        let sealed = crypto::seal(&self.combined_key(&token), plaintext.as_bytes())?;
        let id = self.backend.put(&sealed, created_at, self.id_length)?;
        Ok((id, token))
    }

    /// Take the record for `id` and decrypt it with `token`.
    ///
    /// The record is removed before decryption is attempted, so a wrong token
    /// destroys the secret without revealing it.
    pub fn retrieve(&self, id: &str, token: &str) -> StoreResult<String> {
        let record = self.backend.take(id)?;

        // A token of the wrong length would otherwise surface as a key-size
        // configuration error.
        if token.len() != self.token_length {
            debug!(id = %id, "secret destroyed after malformed token");
            return Err(StoreError::AuthenticationFailure);
        }

        let plaintext = match crypto::open(&self.combined_key(token), &record.ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(id = %id, error = %e, "secret destroyed after failed decryption");
                return Err(e);
            }
        };

        let value = String::from_utf8(plaintext.to_vec())
            .map_err(|_| StoreError::AuthenticationFailure)?;
        debug!(id = %id, "retrieved secret");
        Ok(value)
    }

    /// Delete every record older than `ttl`. Returns how many went.
    pub fn sweep_expired(&self, ttl: Duration) -> StoreResult<usize> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::InvalidConfig(format!("ttl out of range: {e}")))?;
        self.backend.sweep_expired(Utc::now() - ttl)
    }

    fn combined_key(&self, token: &str) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(Vec::with_capacity(self.key_part.len() + token.len()));
        key.extend_from_slice(self.key_part.as_bytes());
        key.extend_from_slice(token.as_bytes());
        key
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.backend.name())
            .field("id_length", &self.id_length)
            .field("token_length", &self.token_length)
            .finish_non_exhaustive()
    }
}
