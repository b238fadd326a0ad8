//! Shared in-process holder for the WireGuard private key.

use parking_lot::RwLock;

use super::PrivateKey;

/// Process-wide cell holding at most one private key.
///
/// Written only by the key reconciler; read concurrently by the identity
/// and interface reconcilers. Once a key has been published it is never
/// replaced by a different one (the agent does not rotate keys).
#[derive(Debug, Default)]
pub struct KeyStore {
    key: RwLock<Option<PrivateKey>>,
}

impl KeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the private key.
    pub fn set(&self, key: PrivateKey) {
        *self.key.write() = Some(key);
    }

    /// The current private key, if one has been published.
    pub fn get(&self) -> Option<PrivateKey> {
        self.key.read().clone()
    }

    /// True once a key has been published.
    pub fn has_key(&self) -> bool {
        self.key.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let store = KeyStore::new();
        assert!(!store.has_key());
        assert!(store.get().is_none());
    }

    #[test]
    fn set_publishes_the_key() {
        let store = KeyStore::new();
        let key = PrivateKey::generate();

        store.set(key.clone());

        assert!(store.has_key());
        assert_eq!(store.get().unwrap(), key);
    }

    #[test]
    fn equal_valued_set_is_idempotent() {
        let store = KeyStore::new();
        let key = PrivateKey::generate();

        store.set(key.clone());
        store.set(key.clone());

        assert_eq!(store.get().unwrap(), key);
    }

    #[test]
    fn readers_share_the_store_across_threads() {
        use std::sync::Arc;

        let store = Arc::new(KeyStore::new());
        let key = PrivateKey::generate();
        store.set(key.clone());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    assert_eq!(store.get().unwrap(), key);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
