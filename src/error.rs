//! Error types for the wgkube agent

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// An inventory operation exceeded its time bound
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out (e.g. "list nodes")
        operation: String,
        /// The bound that was exceeded
        timeout: Duration,
    },

    /// Key handling error (generation, parsing, persistence)
    #[error(transparent)]
    Key(#[from] crate::key::KeyError),

    /// A node record field was missing or unparseable
    #[error(transparent)]
    NodeField(#[from] crate::inventory::node::FieldError),

    /// The local node has no address of a usable type
    #[error("node has no usable address (wanted one of: InternalIP, ExternalIP)")]
    NoUsableAddress,

    /// More than one inventory node advertises the same public key
    #[error("more than one node advertises public key '{public_key}': {}", .nodes.join(", "))]
    AmbiguousPublicKey {
        /// The contested public key (base64)
        public_key: String,
        /// Names of the claiming nodes
        nodes: Vec<String>,
    },

    /// The pod CIDR yields no usable interface address
    #[error("pod CIDR '{cidr}' has no usable host address")]
    UnusableCidr {
        /// The offending network
        cidr: ipnet::Ipv4Net,
    },

    /// Netlink transport error
    #[error("netlink error: {0}")]
    Netlink(String),

    /// WireGuard control transport error
    #[error("wireguard error: {0}")]
    Wireguard(String),

    /// Template rendering error
    #[error(transparent)]
    Template(#[from] crate::template::TemplateError),

    /// Filesystem error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An error attributed to a single inventory node
    #[error("node '{node}': {source}")]
    ForNode {
        /// Name of the node the error belongs to
        node: String,
        /// The underlying error
        source: Box<Error>,
    },

    /// Several independent failures from one reconcile cycle
    #[error(transparent)]
    Many(#[from] Errors),
}

impl Error {
    /// Create a netlink error with the given message
    pub fn netlink(msg: impl Into<String>) -> Self {
        Self::Netlink(msg.into())
    }

    /// Create a wireguard error with the given message
    pub fn wireguard(msg: impl Into<String>) -> Self {
        Self::Wireguard(msg.into())
    }

    /// Attribute an error to a named inventory node
    pub fn for_node(node: impl Into<String>, err: Error) -> Self {
        Self::ForNode {
            node: node.into(),
            source: Box::new(err),
        }
    }

    /// True if this is an optimistic-concurrency conflict from the
    /// inventory (HTTP 409). Used as the retry predicate for node updates.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}

/// Accumulator for independent per-item failures within one reconcile
/// cycle. A single bad inventory record must not block unrelated work,
/// so errors are collected and surfaced together at the end of the cycle.
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

impl Errors {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    /// True if nothing failed
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `Ok(())` if nothing failed, otherwise the accumulated error
    pub fn into_result(self) -> Result<(), Error> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Many(self))
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred: ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}
