//! Encryption and decryption of JSON payloads between two peers.
//!
//! Wire form: base64(`nonce (24 bytes) || ciphertext`), where the ciphertext
//! carries the 16-byte Poly1305 tag.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use x25519_dalek::PublicKey;

use crate::keys::{derive_shared_key, Identity, SharedKey};
use crate::types::{ChannelBoxError, Result, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Encrypt a JSON-serializable payload under a shared key.
///
/// A fresh random nonce is drawn for every call.
pub fn encrypt<T: Serialize + ?Sized>(key: &SharedKey, payload: &T) -> Result<String> {
    let plaintext = serde_json::to_vec(payload)
        .map_err(|e| ChannelBoxError::EncryptionError(format!("JSON encode failed: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| ChannelBoxError::EncryptionError(format!("Cipher init failed: {e}")))?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| ChannelBoxError::EncryptionError(format!("Seal failed: {e}")))?;

    let mut full_message = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    full_message.extend_from_slice(&nonce_bytes);
    full_message.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(full_message))
}

/// Decrypt a wire message produced by [`encrypt`].
///
/// Fails closed: malformed base64, truncated input, and tag mismatches all
/// return [`ChannelBoxError::DecryptionError`] without any plaintext.
pub fn decrypt<T: DeserializeOwned>(key: &SharedKey, message: &str) -> Result<T> {
    let full_message = STANDARD
        .decode(message)
        .map_err(|e| ChannelBoxError::DecryptionError(format!("Invalid base64: {e}")))?;

    if full_message.len() < NONCE_SIZE + TAG_SIZE {
        return Err(ChannelBoxError::DecryptionError(format!(
            "Message too short: {} bytes (minimum {})",
            full_message.len(),
            NONCE_SIZE + TAG_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = full_message.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| ChannelBoxError::DecryptionError(format!("Cipher init failed: {e}")))?;
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| ChannelBoxError::DecryptionError("Could not decrypt message".to_string()))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| ChannelBoxError::DecryptionError(format!("Invalid JSON payload: {e}")))
}

/// Encrypt for a peer without a precomputed key.
pub fn encrypt_for<T: Serialize + ?Sized>(
    identity: &Identity,
    peer_public_key: &[u8; KEY_SIZE],
    payload: &T,
) -> Result<String> {
    let key = derive_shared_key(identity.secret_key(), &PublicKey::from(*peer_public_key));
    encrypt(&key, payload)
}

/// Decrypt a message from a peer without a precomputed key.
pub fn decrypt_from<T: DeserializeOwned>(
    identity: &Identity,
    peer_public_key: &[u8; KEY_SIZE],
    message: &str,
) -> Result<T> {
    let key = derive_shared_key(identity.secret_key(), &PublicKey::from(*peer_public_key));
    decrypt(&key, message)
}
