//! Access to the cluster's node inventory.
//!
//! The [`NodeInventory`] trait is the seam between the reconcilers and the
//! Kubernetes API: production code goes through [`KubeNodeInventory`],
//! tests mock the trait.

pub mod node;

mod index;

pub use index::PublicKeyIndex;

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, PostParams};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Bound on individual inventory calls; a hung API server must not wedge a
/// reconcile cycle past its tick.
pub const INVENTORY_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait abstracting node inventory operations
///
/// Updates use optimistic concurrency: the write carries the resource
/// version of the read it was derived from, and the server rejects it with
/// a conflict if the object moved on. Callers retry from a fresh `get`
/// (see [`crate::retry`]).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Fetch a single node by name
    async fn get(&self, name: &str) -> Result<Node>;

    /// List all nodes in the cluster
    async fn list(&self) -> Result<Vec<Node>>;

    /// Write back a mutated node object
    async fn update(&self, node: &Node) -> Result<Node>;
}

/// Production inventory backed by the Kubernetes API
pub struct KubeNodeInventory {
    api: Api<Node>,
    timeout: Duration,
}

impl KubeNodeInventory {
    /// Create an inventory client from a Kubernetes client
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
            timeout: INVENTORY_TIMEOUT,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = std::result::Result<T, kube::Error>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_owned(),
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl NodeInventory for KubeNodeInventory {
    async fn get(&self, name: &str) -> Result<Node> {
        self.bounded("get node", self.api.get(name)).await
    }

    async fn list(&self) -> Result<Vec<Node>> {
        let list = self
            .bounded("list nodes", self.api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn update(&self, node: &Node) -> Result<Node> {
        let name = node::name(node)?;
        let params = PostParams::default();
        self.bounded("update node", self.api.replace(name, &params, node))
            .await
    }
}
