//! Key reconciler: owns the on-disk private key.
//!
//! Generates a key on first run, re-reads the file on every cycle and
//! publishes whatever is on disk to the shared [`KeyStore`]. The file is
//! authoritative; the agent never rotates it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Action, Reconciler};
use crate::key::{self, KeyStore, PrivateKey};
use crate::Result;

/// Reconciler for the private key file and key store.
pub struct KeyReconciler {
    path: PathBuf,
    store: Arc<KeyStore>,
}

impl KeyReconciler {
    /// Create a key reconciler for the key file at `path`.
    pub fn new(path: PathBuf, store: Arc<KeyStore>) -> Self {
        Self { path, store }
    }
}

#[async_trait]
impl Reconciler for KeyReconciler {
    fn name(&self) -> &'static str {
        "key"
    }

    async fn reconcile(&self) -> Result<Action> {
        match key::load(&self.path)? {
            None => {
                debug!(path = %self.path.display(), "Generating new private key");

                let generated = PrivateKey::generate();
                key::persist(&self.path, &generated)?;
                self.store.set(generated);

                info!(path = %self.path.display(), "Generated a new private key");
            }
            Some(on_disk) => {
                if self.store.get().as_ref() != Some(&on_disk) {
                    self.store.set(on_disk);
                    debug!(path = %self.path.display(), "Published private key from disk");
                }
            }
        }

        Ok(Action::done())
    }
}
