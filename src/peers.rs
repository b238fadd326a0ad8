//! Derivation and diffing of WireGuard peer configurations from node
//! records.
//!
//! [`desired_peer`] builds the configuration a remote node should be
//! peered with; [`updated_peer`] reconciles a peer that is already on the
//! device against the inventory. Both are pure over their inputs so the
//! interface reconciler stays a thin orchestration layer.

use std::fmt;
use std::net::SocketAddr;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info};

use crate::inventory::node::{self, FieldError};
use crate::inventory::PublicKeyIndex;
use crate::kernel::DevicePeer;
use crate::key::PublicKey;
use crate::Result;

/// Why a node was skipped instead of peered.
///
/// Structurally incomplete nodes (freshly joined, not yet initialized) are
/// expected and not errors; they become peers on a later cycle once their
/// records fill in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The node has not advertised a public key yet
    UninitializedPublicKey,
    /// The node has not advertised an endpoint yet
    UninitializedEndpoint,
    /// The node has no pod CIDR assigned yet
    UninitializedPodCidr,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::UninitializedPublicKey => "no public key advertised",
            SkipReason::UninitializedEndpoint => "no endpoint advertised",
            SkipReason::UninitializedPodCidr => "no pod CIDR assigned",
        };
        f.write_str(reason)
    }
}

/// Result of deriving a peer configuration from a node record.
#[derive(Clone, Debug)]
pub enum Derivation {
    /// The node is fully initialized and should be peered
    Peer(PeerSpec),
    /// The node is not ready to be peered
    Skipped(SkipReason),
}

/// Desired configuration for one peer on the WireGuard device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSpec {
    /// The peer's public key
    pub public_key: PublicKey,
    /// The peer's UDP endpoint
    pub endpoint: Option<SocketAddr>,
    /// Networks to accept from and route to the peer
    pub allowed_ips: Vec<Ipv4Net>,
    /// Remove this peer from the device instead of configuring it
    pub remove: bool,
}

impl PeerSpec {
    /// A configuration that removes the peer with `public_key`.
    pub fn removal(public_key: PublicKey) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            remove: true,
        }
    }
}

/// Derive the desired peer configuration for a (remote) node.
///
/// Returns [`Derivation::Skipped`] for nodes whose records are not filled
/// in yet; malformed records are errors.
pub fn desired_peer(n: &Node) -> Result<Derivation> {
    let public_key = match node::public_key(n) {
        Ok(key) => key,
        Err(FieldError::MissingPublicKey) => {
            return Ok(Derivation::Skipped(SkipReason::UninitializedPublicKey))
        }
        Err(e) => return Err(e.into()),
    };

    let endpoint = match node::endpoint(n) {
        Ok(endpoint) => endpoint,
        Err(FieldError::MissingEndpoint) => {
            return Ok(Derivation::Skipped(SkipReason::UninitializedEndpoint))
        }
        Err(e) => return Err(e.into()),
    };

    let allowed_ips = match node::allowed_networks(n) {
        Ok(networks) => networks,
        Err(FieldError::MissingPodCidr) => {
            return Ok(Derivation::Skipped(SkipReason::UninitializedPodCidr))
        }
        Err(e) => return Err(e.into()),
    };

    debug!(
        public_key = %public_key,
        endpoint = %endpoint,
        allowed_ips = ?allowed_ips,
        "Derived peer config"
    );

    Ok(Derivation::Peer(PeerSpec {
        public_key,
        endpoint: Some(endpoint),
        allowed_ips,
        remove: false,
    }))
}

/// Reconcile a peer already present on the device against the inventory.
///
/// If no node advertises the peer's public key anymore the peer is marked
/// for removal. Otherwise the allowed-IPs and endpoint are recomputed from
/// the node record and replaced on mismatch.
pub fn updated_peer(existing: &DevicePeer, index: &PublicKeyIndex<'_>) -> Result<PeerSpec> {
    let key_b64 = existing.public_key.to_base64();

    let n = match index.lookup(&key_b64)? {
        Some(n) => n,
        None => {
            info!(
                public_key = %key_b64,
                "Marking peer for removal as no node advertises its key anymore"
            );
            return Ok(PeerSpec::removal(existing.public_key));
        }
    };

    let mut spec = PeerSpec {
        public_key: existing.public_key,
        endpoint: existing.endpoint,
        allowed_ips: existing.allowed_ips.clone(),
        remove: false,
    };

    let networks = node::allowed_networks(n)?;
    if !same_networks(&spec.allowed_ips, &networks) {
        info!(public_key = %key_b64, allowed_ips = ?networks, "Updating the peer's allowed networks");
        spec.allowed_ips = networks;
    }

    let endpoint = node::endpoint(n)?;
    if spec.endpoint != Some(endpoint) {
        info!(public_key = %key_b64, endpoint = %endpoint, "Updating the peer's endpoint");
        spec.endpoint = Some(endpoint);
    }

    Ok(spec)
}

// Compared as sets: the kernel does not preserve the order allowed-IPs
// were configured in, and a reordering is not a config change.
fn same_networks(current: &[Ipv4Net], desired: &[Ipv4Net]) -> bool {
    if current.len() != desired.len() {
        return false;
    }

    let mut current = current.to_vec();
    let mut desired = desired.to_vec();
    current.sort();
    desired.sort();
    current == desired
}
