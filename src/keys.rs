//! Session identity and X25519 key agreement.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::types::{
    ChannelBoxError, Result, KEY_SIZE, SHARED_KEY_INFO, SHARED_KEY_SALT, USER_ID_MAX,
    USER_ID_MIN, USER_ID_PREFIX,
};

/// The local participant: an X25519 key pair plus a self-asserted user id.
///
/// Identities live for one session only. The secret key is never serialized
/// and is redacted from `Debug` output; `StaticSecret` zeroizes on drop.
pub struct Identity {
    user_id: String,
    secret_key: StaticSecret,
    public_key: PublicKey,
}

impl Identity {
    /// Generate a fresh key pair and a random user id.
    pub fn generate() -> Self {
        let secret_key = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret_key);
        Self {
            user_id: generate_user_id(),
            secret_key,
            public_key,
        }
    }

    /// Build an identity from a known secret, for fixtures and tests.
    pub fn from_secret_bytes(user_id: impl Into<String>, secret: [u8; KEY_SIZE]) -> Self {
        let secret_key = StaticSecret::from(secret);
        let public_key = PublicKey::from(&secret_key);
        Self {
            user_id: user_id.into(),
            secret_key,
            public_key,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Raw public key bytes, the only key material that goes on the wire.
    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        *self.public_key.as_bytes()
    }

    /// Public key in its wire form (standard base64).
    pub fn public_key_base64(&self) -> String {
        encode_public_key(&self.public_key())
    }

    /// Derive the symmetric key shared with the holder of `peer_public_key`.
    pub fn shared_key_with(&self, peer_public_key: &[u8; KEY_SIZE]) -> SharedKey {
        derive_shared_key(&self.secret_key, &PublicKey::from(*peer_public_key))
    }

    pub(crate) fn secret_key(&self) -> &StaticSecret {
        &self.secret_key
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("public_key", &short_key(&self.public_key()))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// A 32-byte symmetric key agreed between two peers.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// Generate a user id of the form `User-<n>`, `n` in `[1_000_000, 2_000_000)`.
pub fn generate_user_id() -> String {
    let suffix = rand::thread_rng().gen_range(USER_ID_MIN..USER_ID_MAX);
    format!("{USER_ID_PREFIX}{suffix}")
}

/// Perform X25519 ECDH key exchange.
///
/// # Returns
/// 32-byte raw shared secret
pub fn x25519_ecdh(private_key: &StaticSecret, public_key: &PublicKey) -> [u8; 32] {
    private_key.diffie_hellman(public_key).to_bytes()
}

/// Derive the symmetric key for a peer pair.
///
/// The raw X25519 output is expanded with HKDF-SHA256 so that both sides,
/// each using their own secret and the other's public key, land on the same
/// uniformly distributed 32-byte key.
pub fn derive_shared_key(private_key: &StaticSecret, peer_public_key: &PublicKey) -> SharedKey {
    let shared_secret = x25519_ecdh(private_key, peer_public_key);
    let hkdf = Hkdf::<Sha256>::new(Some(SHARED_KEY_SALT), &shared_secret);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(SHARED_KEY_INFO, &mut key)
        .expect("32 bytes is a valid length for HKDF-SHA256");
    SharedKey(key)
}

/// Encode a raw public key for the wire.
pub fn encode_public_key(key: &[u8; KEY_SIZE]) -> String {
    STANDARD.encode(key)
}

/// Decode a wire public key, enforcing the 32-byte length.
pub fn decode_public_key(encoded: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ChannelBoxError::InvalidPublicKey(format!("bad base64: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        ChannelBoxError::InvalidPublicKey(format!(
            "expected {KEY_SIZE} bytes, got {}",
            bytes.len()
        ))
    })
}

/// Short hex prefix of a public key, for log lines.
pub fn short_key(key: &[u8; KEY_SIZE]) -> String {
    hex::encode(&key[..4])
}
