//! Type definitions and protocol constants for channelbox.

use thiserror::Error;

/// Size of an X25519 public or secret key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the XChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Lower bound (inclusive) of the numeric suffix of a generated user id.
pub const USER_ID_MIN: u32 = 1_000_000;

/// Upper bound (exclusive) of the numeric suffix of a generated user id.
pub const USER_ID_MAX: u32 = 2_000_000;

/// Prefix of every generated user id.
pub const USER_ID_PREFIX: &str = "User-";

/// HKDF salt used when expanding an X25519 shared secret.
pub const SHARED_KEY_SALT: &[u8] = b"channelbox-v1-shared";

/// HKDF info used when expanding an X25519 shared secret.
pub const SHARED_KEY_INFO: &[u8] = b"xchacha20poly1305-key";

/// Cooldown applied after a failed login, in seconds.
pub const DEFAULT_LOGIN_FAILURE_COOLDOWN_SECS: u64 = 120;

/// Errors that can occur during channelbox operations.
#[derive(Error, Debug)]
pub enum ChannelBoxError {
    /// Login, channel fetch, or send failed on the broadcast transport.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// An incoming message was not a well-formed envelope.
    #[error("Protocol parse error: {0}")]
    ProtocolParseError(String),

    /// Ciphertext was malformed or failed authentication.
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    /// Payload could not be serialized or sealed.
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// An operation was attempted without its prerequisites.
    #[error("Invalid state: {0}")]
    StateError(String),

    /// A public key was not 32 bytes or not valid base64.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Required configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, ChannelBoxError>;
