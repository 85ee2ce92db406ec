//! AES-GCM sealing of secret payloads.
//!
//! The key is the server key fragment concatenated with the per-secret token,
//! so its length (and therefore the AES variant) is fixed by deployment
//! configuration: 16 bytes selects AES-128-GCM, 24 AES-192-GCM, 32 AES-256-GCM.
//!
//! Sealed layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use aes_gcm::{
    aead::{consts::U12, generic_array::typenum::Unsigned, Aead, AeadCore, KeyInit, Nonce, OsRng},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm,
};
use zeroize::Zeroizing;

use super::error::{StoreError, StoreResult};

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Key sizes accepted by [`seal`] and [`open`].
pub const KEY_SIZES: [usize; 3] = [16, 24, 32];

/// Size of the random nonce prefixed to every sealed payload.
pub const NONCE_SIZE: usize = 12;

/// Encrypt and authenticate `plaintext` under `key`, returning `nonce || ciphertext`.
pub fn seal(key: &[u8], plaintext: &[u8]) -> StoreResult<Vec<u8>> {
    match key.len() {
        16 => seal_with::<Aes128Gcm>(key, plaintext),
        24 => seal_with::<Aes192Gcm>(key, plaintext),
        32 => seal_with::<Aes256Gcm>(key, plaintext),
        n => Err(StoreError::InvalidKeyLength(n)),
    }
}

/// Split the nonce prefix off `sealed` and decrypt the remainder under `key`.
///
/// Truncated input, a wrong key and tampered bytes all fail the same way.
pub fn open(key: &[u8], sealed: &[u8]) -> StoreResult<Zeroizing<Vec<u8>>> {
    match key.len() {
        16 => open_with::<Aes128Gcm>(key, sealed),
        24 => open_with::<Aes192Gcm>(key, sealed),
        32 => open_with::<Aes256Gcm>(key, sealed),
        n => Err(StoreError::InvalidKeyLength(n)),
    }
}

fn seal_with<C>(key: &[u8], plaintext: &[u8]) -> StoreResult<Vec<u8>>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| StoreError::InvalidKeyLength(key.len()))?;
    let nonce = C::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| StoreError::Encryption)?;

    let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open_with<C>(key: &[u8], sealed: &[u8]) -> StoreResult<Zeroizing<Vec<u8>>>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| StoreError::InvalidKeyLength(key.len()))?;

    let nonce_size = <C as AeadCore>::NonceSize::USIZE;
    if sealed.len() < nonce_size {
        return Err(StoreError::AuthenticationFailure);
    }
    let (nonce, ciphertext) = sealed.split_at(nonce_size);

    let plaintext = cipher
        .decrypt(Nonce::<C>::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::AuthenticationFailure)?;

    Ok(Zeroizing::new(plaintext))
}
