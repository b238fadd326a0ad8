//! Interface reconciler: the WireGuard link and its peer set.
//!
//! One cycle walks the link into shape (exists, addressed, up), then
//! assembles the full desired peer set from the device's current peers and
//! the node inventory, and applies it as a single device configuration.
//! Failures deriving one peer are collected and do not abort the cycle;
//! breaking the whole overlay because one node's record is bad would be
//! far worse than skipping that node for a tick.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::{debug, info};

use super::{Action, Reconciler, PRECONDITION_WAIT};
use crate::error::Errors;
use crate::inventory::{node, NodeInventory, PublicKeyIndex};
use crate::kernel::{DeviceConfig, LinkApi, LinkRef, LinkState, WireguardApi};
use crate::key::KeyStore;
use crate::metrics;
use crate::peers::{self, Derivation, PeerSpec};
use crate::{Error, Result};

/// Reconciler for the WireGuard link and device configuration.
pub struct InterfaceReconciler {
    inventory: Arc<dyn NodeInventory>,
    links: Arc<dyn LinkApi>,
    wireguard: Arc<dyn WireguardApi>,
    store: Arc<KeyStore>,
    interface: String,
    node_name: String,
    listen_port: u16,
}

impl InterfaceReconciler {
    /// Create an interface reconciler for the link named `interface`.
    pub fn new(
        inventory: Arc<dyn NodeInventory>,
        links: Arc<dyn LinkApi>,
        wireguard: Arc<dyn WireguardApi>,
        store: Arc<KeyStore>,
        interface: String,
        node_name: String,
        listen_port: u16,
    ) -> Self {
        Self {
            inventory,
            links,
            wireguard,
            store,
            interface,
            node_name,
            listen_port,
        }
    }

    async fn ensure_link(&self) -> Result<LinkRef> {
        let link = match self.links.link_by_name(&self.interface).await? {
            Some(link) => link,
            None => {
                info!(interface = %self.interface, "WireGuard link does not exist. Creating...");
                self.links.link_add_wireguard(&self.interface).await?;

                self.links
                    .link_by_name(&self.interface)
                    .await?
                    .ok_or_else(|| {
                        Error::netlink(format!(
                            "link '{}' missing right after creation",
                            self.interface
                        ))
                    })?
            }
        };

        Ok(link)
    }

    async fn ensure_address(&self, link: &LinkRef) -> Result<()> {
        let n = self.inventory.get(&self.node_name).await?;
        let pod_cidr = node::pod_cidr(&n)?;
        let wg_addr = wireguard_address(pod_cidr)?;

        let addresses = self.links.addr_list(link.index).await?;
        if !addresses.contains(&wg_addr) {
            self.links.addr_add(link.index, wg_addr).await?;
            info!(wireguard_address = %wg_addr, "Configured address on WireGuard link");
        }

        Ok(())
    }

    async fn ensure_up(&self, link: &LinkRef) -> Result<()> {
        if link.oper_state == LinkState::Up {
            return Ok(());
        }

        self.links.link_set_up(link.index).await?;

        // The kernel reports the state as unknown right after set-up, so
        // only announce the transition when the link was really down.
        if link.oper_state == LinkState::Down {
            info!(interface = %self.interface, "Brought WireGuard link up");
        }

        Ok(())
    }
}

#[async_trait]
impl Reconciler for InterfaceReconciler {
    fn name(&self) -> &'static str {
        "interface"
    }

    async fn reconcile(&self) -> Result<Action> {
        let Some(private_key) = self.store.get() else {
            debug!("Requeueing as the private key does not exist yet");
            return Ok(Action::requeue_after(PRECONDITION_WAIT));
        };

        let link = self.ensure_link().await?;
        self.ensure_address(&link).await?;
        self.ensure_up(&link).await?;

        let device = self.wireguard.device(&self.interface).await?;
        metrics::WIREGUARD_PEER_COUNT.set(device.peers.len() as i64);

        let nodes = self.inventory.list().await?;
        let index = PublicKeyIndex::build(&nodes);

        let mut errs = Errors::new();
        let mut flagged = HashSet::new();

        // Desired peer set, keyed by public key. Existing peers first:
        // update their fields or mark them for removal.
        let mut desired: BTreeMap<String, PeerSpec> = BTreeMap::new();
        for peer in &device.peers {
            match peers::updated_peer(peer, &index) {
                Ok(spec) => {
                    desired.insert(spec.public_key.to_base64(), spec);
                }
                Err(err) => push_once(&mut errs, &mut flagged, err),
            }
        }

        // Then every inventory node that is not peered yet.
        for n in &nodes {
            let name = match node::name(n) {
                Ok(name) => name,
                Err(err) => {
                    errs.push(err.into());
                    continue;
                }
            };
            if name == self.node_name {
                continue;
            }

            let Some(public_key) = node::public_key_annotation(n) else {
                debug!(node = name, "Skipping node as it has no public key set");
                continue;
            };
            if desired.contains_key(public_key) {
                continue;
            }

            // A contested key must not be programmed with either
            // claimant's networks.
            if let Err(err) = index.lookup(public_key) {
                push_once(&mut errs, &mut flagged, err);
                continue;
            }

            match peers::desired_peer(n) {
                Ok(Derivation::Peer(spec)) => {
                    info!(node = name, public_key = %public_key, "Adding node as a WireGuard peer");
                    desired.insert(public_key.to_owned(), spec);
                }
                Ok(Derivation::Skipped(reason)) => {
                    debug!(node = name, reason = %reason, "Skipping uninitialized node");
                }
                Err(err) => errs.push(Error::for_node(name, err)),
            }
        }

        let config = DeviceConfig {
            private_key,
            listen_port: self.listen_port,
            peers: desired.into_values().collect(),
        };
        if let Err(err) = self.wireguard.configure_device(&self.interface, &config).await {
            errs.push(err);
        }

        errs.into_result()?;
        Ok(Action::done())
    }
}

// The link address is the pod CIDR's first usable host as a /32.
fn wireguard_address(pod_cidr: Ipv4Net) -> Result<Ipv4Net> {
    let first = pod_cidr
        .hosts()
        .next()
        .ok_or(Error::UnusableCidr { cidr: pod_cidr })?;
    Ok(Ipv4Net::from(first))
}

// Ambiguity affects every claimant of the same key; report it once.
fn push_once(errs: &mut Errors, flagged: &mut HashSet<String>, err: Error) {
    if let Error::AmbiguousPublicKey { public_key, .. } = &err {
        if !flagged.insert(public_key.clone()) {
            return;
        }
    }
    errs.push(err);
}
