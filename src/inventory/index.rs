//! Lookup of inventory nodes by their advertised public key.
//!
//! Built fresh from the node snapshot a reconcile cycle already holds.
//! A public key claimed by more than one node is a cluster misconfiguration
//! that peer programming must not guess its way through.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;

use super::node;
use crate::{Error, Result};

/// Index of a node-list snapshot keyed by public key annotation.
pub struct PublicKeyIndex<'a> {
    by_key: HashMap<&'a str, Vec<&'a Node>>,
}

impl<'a> PublicKeyIndex<'a> {
    /// Index `nodes`. Nodes without a public key annotation are absent.
    pub fn build(nodes: &'a [Node]) -> Self {
        let mut by_key: HashMap<&str, Vec<&Node>> = HashMap::new();

        for n in nodes {
            if let Some(key) = node::public_key_annotation(n) {
                by_key.entry(key).or_default().push(n);
            }
        }

        Self { by_key }
    }

    /// The node advertising `public_key`, if exactly one does.
    ///
    /// `Ok(None)` signals that no node claims the key (the peer should be
    /// removed); more than one claimant is [`Error::AmbiguousPublicKey`].
    pub fn lookup(&self, public_key: &str) -> Result<Option<&'a Node>> {
        match self.by_key.get(public_key).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([single]) => Ok(Some(single)),
            Some(claimants) => Err(Error::AmbiguousPublicKey {
                public_key: public_key.to_owned(),
                nodes: claimants
                    .iter()
                    .map(|n| node::name(n).unwrap_or("<unnamed>").to_owned())
                    .collect(),
            }),
        }
    }
}
