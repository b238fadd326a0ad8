//! wgkube - WireGuard mesh overlay for Kubernetes nodes
//!
//! wgkube runs once per node and, together with its siblings on the other
//! nodes, builds an encrypted overlay network for pod traffic. Peers are
//! discovered through the cluster's node inventory: every agent advertises
//! its WireGuard public key and reachable endpoint as node annotations and
//! programs the local kernel from what the other nodes advertise.
//!
//! # Architecture
//!
//! The agent is a set of cooperating control loops, each one idempotent and
//! re-driven on a fixed cadence:
//!
//! - the **key** reconciler owns the on-disk private key and publishes it to
//!   the in-process [`key::KeyStore`];
//! - the **identity** reconciler advertises the public key and endpoint on
//!   the local Node object;
//! - the **interface** reconciler keeps the WireGuard link created,
//!   addressed, up, and its peer set in sync with the inventory;
//! - the **route** reconciler points every remote pod subnet at the link;
//! - the **cni** reconciler renders the container-runtime network plugin
//!   configuration from templates.
//!
//! # Modules
//!
//! - [`error`] - Error types and the per-cycle multi-error accumulator
//! - [`inventory`] - Node inventory access and node record helpers
//! - [`kernel`] - Kernel collaborator contracts (netlink, WireGuard control)
//! - [`key`] - Key pair handling and the shared key store
//! - [`metrics`] - Prometheus metrics
//! - [`peers`] - Peer configuration derivation and diffing
//! - [`reconciler`] - The control loops and their runner
//! - [`retry`] - Bounded retries with exponential backoff
//! - [`telemetry`] - Telemetry HTTP endpoint (metrics, liveness)
//! - [`template`] - Plugin-config template rendering

#![cfg_attr(not(test), deny(missing_docs))]

pub mod error;
pub mod inventory;
pub mod kernel;
pub mod key;
pub mod metrics;
pub mod peers;
pub mod reconciler;
pub mod retry;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Node annotation carrying a node's WireGuard public key (base64).
pub const ANNOTATION_PUBLIC_KEY: &str = "wireguard/public_key";

/// Node annotation carrying a node's WireGuard endpoint (`host:port`).
pub const ANNOTATION_ENDPOINT: &str = "wireguard/endpoint";

/// Default name of the WireGuard link.
pub const DEFAULT_INTERFACE: &str = "wg-kube";

/// Default UDP port WireGuard listens on.
pub const DEFAULT_WIREGUARD_PORT: u16 = 51820;

/// Kernel routing table the overlay routes are installed into (main).
pub const MAIN_ROUTING_TABLE: u32 = 254;
