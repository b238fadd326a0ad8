//! Accessors for the fields of a Node record this agent cares about.
//!
//! Node objects are externally owned; everything here reads or mutates the
//! in-memory copy only. The two annotations `wireguard/public_key` and
//! `wireguard/endpoint` are the agent's own; pod CIDR and addresses belong
//! to the cluster.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{Node, NodeAddress};
use thiserror::Error;

use crate::key::{KeyError, PublicKey};
use crate::{ANNOTATION_ENDPOINT, ANNOTATION_PUBLIC_KEY};

/// Node address type for cluster-internal addresses.
pub const ADDRESS_TYPE_INTERNAL_IP: &str = "InternalIP";

/// Node address type for externally reachable addresses.
pub const ADDRESS_TYPE_EXTERNAL_IP: &str = "ExternalIP";

/// Address types usable as a WireGuard endpoint, most preferred first.
pub const PREFERRED_ADDRESS_TYPES: [&str; 2] =
    [ADDRESS_TYPE_INTERNAL_IP, ADDRESS_TYPE_EXTERNAL_IP];

/// A node record field was missing or unparseable.
///
/// The `Missing*` variants describe structurally incomplete (uninitialized)
/// nodes and are mapped to skips rather than failures by the peer
/// derivation; the `Invalid*` variants are real errors.
#[derive(Debug, Error)]
pub enum FieldError {
    /// The node has no name
    #[error("node has no name")]
    MissingName,

    /// No public key annotation is set
    #[error("no public key found in the node's '{ANNOTATION_PUBLIC_KEY}' annotation")]
    MissingPublicKey,

    /// No endpoint annotation is set
    #[error("no endpoint found in the node's '{ANNOTATION_ENDPOINT}' annotation")]
    MissingEndpoint,

    /// The node has no pod CIDR assigned yet
    #[error("pod CIDR is empty")]
    MissingPodCidr,

    /// The public key annotation did not parse
    #[error("could not parse public key '{value}': {source}")]
    InvalidPublicKey {
        /// The annotation value
        value: String,
        /// Underlying parse error
        source: KeyError,
    },

    /// The endpoint annotation did not parse as `host:port`
    #[error("could not parse endpoint '{value}': {source}")]
    InvalidEndpoint {
        /// The annotation value
        value: String,
        /// Underlying parse error
        source: std::net::AddrParseError,
    },

    /// The pod CIDR did not parse as an IPv4 network
    #[error("could not parse pod CIDR '{value}': {source}")]
    InvalidPodCidr {
        /// The recorded pod CIDR
        value: String,
        /// Underlying parse error
        source: ipnet::AddrParseError,
    },

    /// A listed node address did not parse as an IPv4 address
    #[error("could not parse node address '{value}' as an IPv4 address")]
    InvalidAddress {
        /// The recorded address
        value: String,
    },
}

/// The node's name, or [`FieldError::MissingName`].
pub fn name(node: &Node) -> Result<&str, FieldError> {
    node.metadata
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or(FieldError::MissingName)
}

fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

fn annotations_mut(node: &mut Node) -> &mut BTreeMap<String, String> {
    node.metadata.annotations.get_or_insert_with(BTreeMap::new)
}

/// The raw public key annotation, if set and non-empty.
pub fn public_key_annotation(node: &Node) -> Option<&str> {
    annotation(node, ANNOTATION_PUBLIC_KEY)
}

/// The node's advertised public key.
pub fn public_key(node: &Node) -> Result<PublicKey, FieldError> {
    let value = public_key_annotation(node).ok_or(FieldError::MissingPublicKey)?;
    PublicKey::from_base64(value).map_err(|source| FieldError::InvalidPublicKey {
        value: value.to_owned(),
        source,
    })
}

/// Set the public key annotation if it is currently empty.
///
/// A non-empty annotation is authoritative once set and is never
/// overwritten, even when it disagrees with `key`. Returns whether the
/// node was mutated.
pub fn set_public_key(node: &mut Node, key: &PublicKey) -> bool {
    if public_key_annotation(node).is_some() {
        return false;
    }

    annotations_mut(node).insert(ANNOTATION_PUBLIC_KEY.to_owned(), key.to_base64());
    true
}

/// The node's advertised WireGuard endpoint.
pub fn endpoint(node: &Node) -> Result<SocketAddr, FieldError> {
    let value = annotation(node, ANNOTATION_ENDPOINT).ok_or(FieldError::MissingEndpoint)?;
    value
        .parse()
        .map_err(|source| FieldError::InvalidEndpoint {
            value: value.to_owned(),
            source,
        })
}

/// Set the endpoint annotation when it differs from `endpoint`.
///
/// Returns whether the node was mutated.
pub fn set_endpoint(node: &mut Node, endpoint: &str) -> bool {
    if annotation(node, ANNOTATION_ENDPOINT) == Some(endpoint) {
        return false;
    }

    annotations_mut(node).insert(ANNOTATION_ENDPOINT.to_owned(), endpoint.to_owned());
    true
}

/// The node's pod CIDR, normalised to its network address.
pub fn pod_cidr(node: &Node) -> Result<Ipv4Net, FieldError> {
    let value = node
        .spec
        .as_ref()
        .and_then(|s| s.pod_cidr.as_deref())
        .filter(|c| !c.is_empty())
        .ok_or(FieldError::MissingPodCidr)?;

    value
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|source| FieldError::InvalidPodCidr {
            value: value.to_owned(),
            source,
        })
}

/// The networks WireGuard should accept from and route to this node:
/// `addr/32` for every Internal/External IP in status order, then the pod
/// CIDR. Address entries of other types are ignored.
pub fn allowed_networks(node: &Node) -> Result<Vec<Ipv4Net>, FieldError> {
    let mut networks = Vec::new();

    for addr in addresses(node) {
        if addr.type_ != ADDRESS_TYPE_INTERNAL_IP && addr.type_ != ADDRESS_TYPE_EXTERNAL_IP {
            continue;
        }

        let ip: Ipv4Addr = addr
            .address
            .parse()
            .map_err(|_| FieldError::InvalidAddress {
                value: addr.address.clone(),
            })?;
        networks.push(Ipv4Net::from(ip));
    }

    networks.push(pod_cidr(node)?);

    Ok(networks)
}

/// The first address on the node matching `preferred`, in preference order.
pub fn preferred_address<'a>(node: &'a Node, preferred: &[&str]) -> Option<&'a NodeAddress> {
    preferred
        .iter()
        .find_map(|wanted| addresses(node).iter().find(|a| a.type_ == *wanted))
}

fn addresses(node: &Node) -> &[NodeAddress] {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_deref())
        .unwrap_or(&[])
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Build a node the way the cluster would present it.
    pub fn node(
        name: &str,
        pod_cidr: Option<&str>,
        addresses: &[(&str, &str)],
        annotations: &[(&str, &str)],
    ) -> Node {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": name,
                "annotations": annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<std::collections::BTreeMap<_, _>>(),
            },
            "spec": {
                "podCIDR": pod_cidr,
            },
            "status": {
                "addresses": addresses
                    .iter()
                    .map(|(type_, address)| {
                        serde_json::json!({"type": type_, "address": address})
                    })
                    .collect::<Vec<_>>(),
            },
        }))
        .expect("valid node fixture")
    }
}
