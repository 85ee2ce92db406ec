use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Stored as bincode-encoded bytes in the durable backend, as-is in memory.
/// `ciphertext` is `nonce || AES-GCM(payload)`; the token needed to open it is
/// never stored.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretRecord {
    pub id: String,
    pub ciphertext: Vec<u8>,
    /// Only used to order expiry; never shown to callers.
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl SecretRecord {
    /// Key of this record in the time index.
    pub fn time_key(&self) -> String {
        time_key(self.created_at, &self.id)
    }
}

/// Fixed-width RFC 3339 encoding (UTC, nanoseconds, `Z` suffix) so that
/// lexicographic order matches chronological order.
pub fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// `encode_time(created_at) || id`.
pub fn time_key(created_at: DateTime<Utc>, id: &str) -> String {
    let mut key = encode_time(created_at);
    key.push_str(id);
    key
}
