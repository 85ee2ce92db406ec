use rand::{distributions::Alphanumeric, Rng};

use super::error::{StoreError, StoreResult};

/// Candidates tried before id allocation gives up. With the default 8
/// alphanumeric characters the space is 62^8, so hitting this cap means the
/// configured id length is far too short for the live record count.
pub const MAX_ID_ATTEMPTS: usize = 64;

/// Random `[A-Za-z0-9]` string of `len` characters.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate an id of `len` characters that `exists` reports as free.
///
/// `exists` must observe the backend's committed state, and the caller must
/// hold the backend's write lock or transaction until the id is inserted.
pub fn new_id<F>(len: usize, mut exists: F) -> StoreResult<String>
where
    F: FnMut(&str) -> StoreResult<bool>,
{
    for _ in 0..MAX_ID_ATTEMPTS {
        let candidate = random_string(len);
        if !exists(&candidate)? {
            return Ok(candidate);
        }
    }
    Err(StoreError::IdSpaceExhausted(MAX_ID_ATTEMPTS))
}

/// Per-secret token. ASCII only, so its byte length equals `len`.
pub fn new_token(len: usize) -> String {
    random_string(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_string_has_requested_length_and_alphabet() {
        let s = random_string(32);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn retries_until_free() {
        let mut calls = 0;
        let id = new_id(8, |_| {
            calls += 1;
            Ok(calls < 3)
        })
        .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(id.len(), 8);
    }

    #[test]
    fn avoids_taken_ids() {
        let mut taken = HashSet::new();
        for _ in 0..200 {
            let id = new_id(2, |c| Ok(taken.contains(c))).unwrap();
            assert!(taken.insert(id));
        }
    }

    #[test]
    fn gives_up_when_space_is_exhausted() {
        let err = new_id(0, |_| Ok(true)).unwrap_err();
        assert!(matches!(err, StoreError::IdSpaceExhausted(MAX_ID_ATTEMPTS)));
    }

    #[test]
    fn propagates_lookup_errors() {
        let err = new_id(8, |_| Err(StoreError::BackendUnavailable("gone".into()))).unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable(_)));
    }
}
