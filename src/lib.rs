//! channelbox - Encrypted peer-to-peer messaging over a broadcast channel
//!
//! Peers announce X25519 public keys on a shared channel, answer each other's
//! handshakes, agree on a master by last announcement, and exchange JSON
//! payloads sealed with XChaCha20-Poly1305.

mod types;
mod keys;
mod crypto;
mod envelope;
mod registry;
mod protocol;
mod connection;
mod transport;
mod memory;
mod config;
mod client;

pub use types::*;
pub use keys::*;
pub use crypto::*;
pub use envelope::*;
pub use registry::*;
pub use protocol::*;
pub use connection::*;
pub use transport::*;
pub use memory::*;
pub use config::*;
pub use client::*;
