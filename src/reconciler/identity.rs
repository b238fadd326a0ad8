//! Node-identity reconciler: advertises this node's public key and
//! endpoint on its inventory record.
//!
//! Both annotation writes go through an optimistic-concurrency loop:
//! refetch the node, reapply the mutation, retry on conflict. The public
//! key annotation is only ever filled in when empty; a value that is
//! already set is authoritative.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Action, Reconciler, PRECONDITION_WAIT};
use crate::inventory::node::{self, PREFERRED_ADDRESS_TYPES};
use crate::inventory::NodeInventory;
use crate::key::KeyStore;
use crate::retry::{retry_if, RetryConfig};
use crate::{Error, Result};

/// Reconciler for the node's advertised identity.
pub struct IdentityReconciler {
    inventory: Arc<dyn NodeInventory>,
    store: Arc<KeyStore>,
    node_name: String,
    wireguard_port: u16,
    retry: RetryConfig,
}

impl IdentityReconciler {
    /// Create an identity reconciler for the node named `node_name`.
    pub fn new(
        inventory: Arc<dyn NodeInventory>,
        store: Arc<KeyStore>,
        node_name: String,
        wireguard_port: u16,
    ) -> Self {
        Self {
            inventory,
            store,
            node_name,
            wireguard_port,
            retry: RetryConfig::default(),
        }
    }

    async fn ensure_public_key(&self, public_key: &crate::key::PublicKey) -> Result<()> {
        retry_if(
            &self.retry,
            "advertise public key",
            Error::is_conflict,
            || async move {
                let mut n = self.inventory.get(&self.node_name).await?;
                if node::set_public_key(&mut n, public_key) {
                    self.inventory.update(&n).await?;
                    info!(public_key = %public_key, "Updated the node's public key");
                }
                Ok(())
            },
        )
        .await
    }

    async fn ensure_endpoint(&self, endpoint: &str) -> Result<()> {
        retry_if(
            &self.retry,
            "advertise endpoint",
            Error::is_conflict,
            || async move {
                let mut n = self.inventory.get(&self.node_name).await?;
                if node::set_endpoint(&mut n, endpoint) {
                    self.inventory.update(&n).await?;
                    info!(endpoint = %endpoint, "Updated the node's WireGuard endpoint");
                }
                Ok(())
            },
        )
        .await
    }
}

#[async_trait]
impl Reconciler for IdentityReconciler {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn reconcile(&self) -> Result<Action> {
        let Some(private_key) = self.store.get() else {
            debug!("Requeueing as the private key does not exist yet");
            return Ok(Action::requeue_after(PRECONDITION_WAIT));
        };

        self.ensure_public_key(&private_key.public_key()).await?;

        let n = self.inventory.get(&self.node_name).await?;
        let address =
            node::preferred_address(&n, &PREFERRED_ADDRESS_TYPES).ok_or(Error::NoUsableAddress)?;
        let endpoint = format!("{}:{}", address.address, self.wireguard_port);

        self.ensure_endpoint(&endpoint).await?;

        Ok(Action::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::node::fixtures::node as make_node;
    use crate::inventory::MockNodeInventory;
    use crate::key::PrivateKey;
    use crate::{ANNOTATION_ENDPOINT, ANNOTATION_PUBLIC_KEY};
    use k8s_openapi::api::core::v1::Node;

    fn store_with_key() -> (Arc<KeyStore>, crate::key::PublicKey) {
        let store = Arc::new(KeyStore::new());
        let key = PrivateKey::generate();
        let public = key.public_key();
        store.set(key);
        (store, public)
    }

    fn reconciler(inventory: MockNodeInventory, store: Arc<KeyStore>) -> IdentityReconciler {
        let mut r = IdentityReconciler::new(Arc::new(inventory), store, "n1".into(), 51820);
        r.retry = RetryConfig {
            initial_delay: std::time::Duration::from_millis(1),
            ..RetryConfig::default()
        };
        r
    }

    fn annotation(n: &Node, key: &str) -> Option<String> {
        n.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .cloned()
    }

    fn conflict() -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }))
    }

    #[tokio::test]
    async fn requeues_shortly_while_no_key_is_published() {
        let inventory = MockNodeInventory::new();
        let store = Arc::new(KeyStore::new());

        let action = reconciler(inventory, store).reconcile().await.unwrap();
        assert_eq!(action, Action::requeue_after(PRECONDITION_WAIT));
    }

    #[tokio::test]
    async fn advertises_key_and_endpoint_on_a_fresh_node() {
        let (store, public) = store_with_key();
        let fresh = make_node("n1", None, &[("InternalIP", "192.168.1.1")], &[]);

        let mut inventory = MockNodeInventory::new();
        {
            let fresh = fresh.clone();
            inventory
                .expect_get()
                .returning(move |_| Ok(fresh.clone()));
        }

        let expected_key = public.to_base64();
        inventory
            .expect_update()
            .withf(move |n: &Node| {
                annotation(n, ANNOTATION_PUBLIC_KEY) == Some(expected_key.clone())
            })
            .times(1)
            .returning(|n| Ok(n.clone()));
        inventory
            .expect_update()
            .withf(|n: &Node| {
                annotation(n, ANNOTATION_ENDPOINT) == Some("192.168.1.1:51820".into())
            })
            .times(1)
            .returning(|n| Ok(n.clone()));

        let action = reconciler(inventory, store).reconcile().await.unwrap();
        assert_eq!(action, Action::done());
    }

    #[tokio::test]
    async fn an_advertised_key_is_never_overwritten() {
        let (store, _) = store_with_key();

        // Another key is already advertised and the endpoint is current.
        let externally_set = "wCPKV+zWz3WB0ijJX4dTpg2vklBpc64agvKd6VAkcX4=";
        let n = make_node(
            "n1",
            None,
            &[("InternalIP", "192.168.1.1")],
            &[
                (ANNOTATION_PUBLIC_KEY, externally_set),
                (ANNOTATION_ENDPOINT, "192.168.1.1:51820"),
            ],
        );

        let mut inventory = MockNodeInventory::new();
        inventory.expect_get().returning(move |_| Ok(n.clone()));
        inventory.expect_update().times(0);

        reconciler(inventory, store).reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn endpoint_change_is_written_back() {
        let (store, public) = store_with_key();

        let n = make_node(
            "n1",
            None,
            &[("InternalIP", "192.168.1.22")],
            &[
                (ANNOTATION_PUBLIC_KEY, &public.to_base64()),
                (ANNOTATION_ENDPOINT, "192.168.1.1:51820"),
            ],
        );

        let mut inventory = MockNodeInventory::new();
        inventory.expect_get().returning(move |_| Ok(n.clone()));
        inventory
            .expect_update()
            .withf(|n: &Node| {
                annotation(n, ANNOTATION_ENDPOINT) == Some("192.168.1.22:51820".into())
            })
            .times(1)
            .returning(|n| Ok(n.clone()));

        reconciler(inventory, store).reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn conflicts_are_retried_from_a_fresh_read() {
        let (store, _) = store_with_key();
        let fresh = make_node("n1", None, &[("InternalIP", "192.168.1.1")], &[]);

        let mut inventory = MockNodeInventory::new();
        {
            let fresh = fresh.clone();
            inventory
                .expect_get()
                .times(4..)
                .returning(move |_| Ok(fresh.clone()));
        }

        // First write conflicts, every later one succeeds.
        let mut first = true;
        inventory.expect_update().returning(move |n| {
            if std::mem::take(&mut first) {
                Err(conflict())
            } else {
                Ok(n.clone())
            }
        });

        reconciler(inventory, store).reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn conflict_exhaustion_surfaces_the_error() {
        let (store, _) = store_with_key();
        let fresh = make_node("n1", None, &[("InternalIP", "192.168.1.1")], &[]);

        let mut inventory = MockNodeInventory::new();
        inventory
            .expect_get()
            .returning(move |_| Ok(fresh.clone()));
        inventory.expect_update().returning(|_| Err(conflict()));

        let err = reconciler(inventory, store).reconcile().await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn a_node_without_usable_address_is_an_error() {
        let (store, public) = store_with_key();

        let n = make_node(
            "n1",
            None,
            &[("Hostname", "n1")],
            &[(ANNOTATION_PUBLIC_KEY, &public.to_base64())],
        );

        let mut inventory = MockNodeInventory::new();
        inventory.expect_get().returning(move |_| Ok(n.clone()));
        inventory.expect_update().times(0);

        let err = reconciler(inventory, store).reconcile().await.unwrap_err();
        assert!(matches!(err, Error::NoUsableAddress));
    }
}
