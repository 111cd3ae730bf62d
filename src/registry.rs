//! Peer key registry and shared-key cache.
//!
//! Both are plain owned maps: the protocol state that holds them is only ever
//! mutated through `&mut`, so a check-then-insert is a single step.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::keys::{Identity, SharedKey};
use crate::types::KEY_SIZE;

/// Mapping from peer user id to that peer's public key.
///
/// Append-only: the first key recorded for a user id is kept for the rest of
/// the session, so a replayed handshake cannot swap a peer's key.
#[derive(Debug, Default, Clone)]
pub struct PeerKeyRegistry {
    keys: HashMap<String, [u8; KEY_SIZE]>,
}

impl PeerKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key if the user id is unknown.
    ///
    /// Returns `true` when the entry was inserted, `false` when the user id
    /// already had a key (the existing key is left untouched).
    pub fn insert_if_absent(&mut self, user_id: &str, public_key: [u8; KEY_SIZE]) -> bool {
        match self.keys.entry(user_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(public_key);
                true
            }
        }
    }

    pub fn get(&self, user_id: &str) -> Option<[u8; KEY_SIZE]> {
        self.keys.get(user_id).copied()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.keys.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Known user ids, sorted.
    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// In-memory cache of derived shared keys, keyed by peer public key.
///
/// Scoped to one local identity and never persisted.
#[derive(Default)]
pub struct SharedKeyCache {
    keys: HashMap<[u8; KEY_SIZE], SharedKey>,
}

impl SharedKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached key for `peer_public_key`, deriving it on first use.
    pub fn get_or_derive(
        &mut self,
        identity: &Identity,
        peer_public_key: &[u8; KEY_SIZE],
    ) -> SharedKey {
        self.keys
            .entry(*peer_public_key)
            .or_insert_with(|| identity.shared_key_with(peer_public_key))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_wins() {
        let mut registry = PeerKeyRegistry::new();

        assert!(registry.insert_if_absent("User-1000001", [1u8; 32]));
        assert!(!registry.insert_if_absent("User-1000001", [2u8; 32]));

        assert_eq!(registry.get("User-1000001"), Some([1u8; 32]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_peer() {
        let registry = PeerKeyRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.contains("User-1000001"));
        assert_eq!(registry.get("User-1000001"), None);
    }

    #[test]
    fn test_user_ids_sorted() {
        let mut registry = PeerKeyRegistry::new();
        registry.insert_if_absent("User-1900000", [1u8; 32]);
        registry.insert_if_absent("User-1100000", [2u8; 32]);
        assert_eq!(registry.user_ids(), vec!["User-1100000", "User-1900000"]);
    }

    #[test]
    fn test_shared_key_cache_derives_once() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut cache = SharedKeyCache::new();

        let first = cache.get_or_derive(&alice, &bob.public_key());
        let second = cache.get_or_derive(&alice, &bob.public_key());

        assert_eq!(first, second);
        assert_eq!(first, alice.shared_key_with(&bob.public_key()));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
