//! Route reconciler: points every remote pod subnet at the WireGuard link.
//!
//! Routes are installed with replace semantics into the main table, so
//! re-running is free and another actor's concurrent change cannot wedge
//! us. Routes are never deleted here: a departed node's route goes away
//! with the link, and deleting from a shared table is not this loop's
//! call to make.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::{Action, Reconciler};
use crate::error::Errors;
use crate::inventory::node::{self, FieldError};
use crate::inventory::NodeInventory;
use crate::kernel::{LinkApi, RouteSpec};
use crate::metrics;
use crate::{Error, Result, MAIN_ROUTING_TABLE};

/// Reconciler for the overlay routes.
pub struct RouteReconciler {
    inventory: Arc<dyn NodeInventory>,
    links: Arc<dyn LinkApi>,
    interface: String,
    node_name: String,
}

impl RouteReconciler {
    /// Create a route reconciler for the link named `interface`.
    pub fn new(
        inventory: Arc<dyn NodeInventory>,
        links: Arc<dyn LinkApi>,
        interface: String,
        node_name: String,
    ) -> Self {
        Self {
            inventory,
            links,
            interface,
            node_name,
        }
    }

    async fn replace_route(
        &self,
        link_index: u32,
        n: &k8s_openapi::api::core::v1::Node,
    ) -> Result<()> {
        let destination = match node::pod_cidr(n) {
            Ok(cidr) => cidr,
            Err(FieldError::MissingPodCidr) => {
                debug!(
                    node = node::name(n).unwrap_or("<unnamed>"),
                    "Skipping node without pod CIDR"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let route = RouteSpec {
            destination,
            link_index,
            table: MAIN_ROUTING_TABLE,
        };

        let start = Instant::now();
        self.links.route_replace(&route).await?;
        metrics::ROUTE_REPLACE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        debug!(route = ?route, "Replaced route");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for RouteReconciler {
    fn name(&self) -> &'static str {
        "route"
    }

    async fn reconcile(&self) -> Result<Action> {
        // The interface reconciler owns link creation; nothing to route
        // over until it has caught up.
        let Some(link) = self.links.link_by_name(&self.interface).await? else {
            debug!(interface = %self.interface, "Skipping route reconciling since the link does not exist yet");
            return Ok(Action::done());
        };

        let nodes = self.inventory.list().await?;

        let mut errs = Errors::new();
        for n in &nodes {
            let name = match node::name(n) {
                Ok(name) => name,
                Err(err) => {
                    errs.push(err.into());
                    continue;
                }
            };
            if name == self.node_name {
                // Never route the local pod subnet into the tunnel.
                continue;
            }

            if let Err(err) = self.replace_route(link.index, n).await {
                errs.push(Error::for_node(name, err));
            }
        }

        errs.into_result()?;
        Ok(Action::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::node::fixtures::node as make_node;
    use crate::inventory::MockNodeInventory;
    use crate::kernel::{LinkRef, LinkState, MockLinkApi};

    fn reconciler(inventory: MockNodeInventory, links: MockLinkApi) -> RouteReconciler {
        RouteReconciler::new(
            Arc::new(inventory),
            Arc::new(links),
            "wg-kube".into(),
            "n1".into(),
        )
    }

    fn wg_link() -> LinkRef {
        LinkRef {
            index: 7,
            name: "wg-kube".into(),
            mtu: 1420,
            oper_state: LinkState::Up,
        }
    }

    #[tokio::test]
    async fn missing_link_is_success_without_work() {
        let mut links = MockLinkApi::new();
        links.expect_link_by_name().returning(|_| Ok(None));
        links.expect_route_replace().times(0);

        let mut inventory = MockNodeInventory::new();
        inventory.expect_list().times(0);

        let action = reconciler(inventory, links).reconcile().await.unwrap();
        assert_eq!(action, Action::done());
    }

    #[tokio::test]
    async fn installs_a_route_per_remote_node() {
        let mut links = MockLinkApi::new();
        links
            .expect_link_by_name()
            .returning(|_| Ok(Some(wg_link())));
        links
            .expect_route_replace()
            .withf(|route: &RouteSpec| {
                route.link_index == 7
                    && route.table == MAIN_ROUTING_TABLE
                    && (route.destination == "10.244.1.0/24".parse().unwrap()
                        || route.destination == "10.244.2.0/24".parse().unwrap())
            })
            .times(2)
            .returning(|_| Ok(()));

        let mut inventory = MockNodeInventory::new();
        inventory.expect_list().returning(|| {
            Ok(vec![
                make_node("n1", Some("10.244.0.0/24"), &[], &[]),
                make_node("n2", Some("10.244.1.0/24"), &[], &[]),
                make_node("n3", Some("10.244.2.0/24"), &[], &[]),
            ])
        });

        reconciler(inventory, links).reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn never_routes_the_local_pod_subnet() {
        let mut links = MockLinkApi::new();
        links
            .expect_link_by_name()
            .returning(|_| Ok(Some(wg_link())));
        links
            .expect_route_replace()
            .withf(|route: &RouteSpec| route.destination != "10.244.0.0/24".parse().unwrap())
            .returning(|_| Ok(()));

        let mut inventory = MockNodeInventory::new();
        inventory.expect_list().returning(|| {
            Ok(vec![
                make_node("n1", Some("10.244.0.0/24"), &[], &[]),
                make_node("n2", Some("10.244.1.0/24"), &[], &[]),
            ])
        });

        reconciler(inventory, links).reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn one_bad_node_does_not_block_the_others() {
        let mut links = MockLinkApi::new();
        links
            .expect_link_by_name()
            .returning(|_| Ok(Some(wg_link())));
        links
            .expect_route_replace()
            .withf(|route: &RouteSpec| route.destination == "10.244.2.0/24".parse().unwrap())
            .times(1)
            .returning(|_| Ok(()));

        let mut inventory = MockNodeInventory::new();
        inventory.expect_list().returning(|| {
            Ok(vec![
                make_node("n1", Some("10.244.0.0/24"), &[], &[]),
                make_node("n2", Some("AAA"), &[], &[]),
                make_node("n3", Some("10.244.2.0/24"), &[], &[]),
            ])
        });

        let err = reconciler(inventory, links).reconcile().await.unwrap_err();
        assert!(err.to_string().contains("n2"));
    }

    #[tokio::test]
    async fn uninitialized_nodes_are_skipped_without_error() {
        let mut links = MockLinkApi::new();
        links
            .expect_link_by_name()
            .returning(|_| Ok(Some(wg_link())));
        links.expect_route_replace().times(0);

        let mut inventory = MockNodeInventory::new();
        inventory.expect_list().returning(|| {
            Ok(vec![
                make_node("n1", Some("10.244.0.0/24"), &[], &[]),
                make_node("n2", None, &[], &[]),
            ])
        });

        reconciler(inventory, links).reconcile().await.unwrap();
    }
}
