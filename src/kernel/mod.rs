//! Contracts for the kernel collaborators.
//!
//! The reconcilers never talk to netlink or the WireGuard control socket
//! directly; they go through the [`LinkApi`] and [`WireguardApi`] traits.
//! Production implementations live in [`netlink`] and [`wireguard`]; tests
//! mock the traits.
//!
//! Everything here is intentionally replace-shaped: kernel state is shared
//! with other actors, so the only mutations offered are idempotent ones
//! (`route_replace`, a full-config `configure_device`, `addr_add` guarded
//! by a membership check in the caller). There is no unconditional delete.

pub mod netlink;
pub mod wireguard;

pub use netlink::NetlinkHandle;
pub use wireguard::WireguardControl;

use std::net::SocketAddr;
use std::time::SystemTime;

use async_trait::async_trait;
use ipnet::Ipv4Net;

#[cfg(test)]
use mockall::automock;

use crate::key::{PrivateKey, PublicKey};
use crate::peers::PeerSpec;
use crate::Result;

/// Operational state of a network link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// The link is operationally up
    Up,
    /// The link is administratively or operationally down
    Down,
    /// The kernel reports any other state (notably right after set-up)
    Unknown,
}

/// A network link as the kernel reports it.
#[derive(Clone, Debug)]
pub struct LinkRef {
    /// Kernel interface index
    pub index: u32,
    /// Interface name
    pub name: String,
    /// Maximum transmission unit
    pub mtu: u32,
    /// Operational state
    pub oper_state: LinkState,
}

/// A route to be installed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteSpec {
    /// Destination network
    pub destination: Ipv4Net,
    /// Output link index
    pub link_index: u32,
    /// Routing table (the main table, 254, for overlay routes)
    pub table: u32,
}

/// A peer as currently configured on the WireGuard device.
#[derive(Clone, Debug)]
pub struct DevicePeer {
    /// The peer's public key
    pub public_key: PublicKey,
    /// The peer's UDP endpoint, if known
    pub endpoint: Option<SocketAddr>,
    /// Networks associated with the peer
    pub allowed_ips: Vec<Ipv4Net>,
    /// Time of the last completed handshake
    pub last_handshake: Option<SystemTime>,
    /// Bytes received from the peer
    pub rx_bytes: u64,
    /// Bytes sent to the peer
    pub tx_bytes: u64,
}

/// Current state of the WireGuard device.
#[derive(Clone, Debug, Default)]
pub struct Device {
    /// UDP port the device listens on
    pub listen_port: Option<u16>,
    /// Configured peers
    pub peers: Vec<DevicePeer>,
}

/// The full desired device configuration applied in one call.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// The device's private key
    pub private_key: PrivateKey,
    /// UDP port to listen on
    pub listen_port: u16,
    /// Desired peer set. Listed peers are created or updated, peers with
    /// `remove` set are deleted; unlisted peers are left untouched.
    pub peers: Vec<PeerSpec>,
}

/// Netlink operations on links, addresses and routes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkApi: Send + Sync {
    /// Look up a link by name; `None` if it does not exist
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkRef>>;

    /// Create a link of type `wireguard`
    async fn link_add_wireguard(&self, name: &str) -> Result<()>;

    /// Bring a link operationally up
    async fn link_set_up(&self, index: u32) -> Result<()>;

    /// IPv4 addresses currently assigned to a link
    async fn addr_list(&self, index: u32) -> Result<Vec<Ipv4Net>>;

    /// Assign an IPv4 address to a link
    async fn addr_add(&self, index: u32, addr: Ipv4Net) -> Result<()>;

    /// Install or replace a route
    async fn route_replace(&self, route: &RouteSpec) -> Result<()>;
}

/// WireGuard device control operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WireguardApi: Send + Sync {
    /// Read the device's current configuration
    async fn device(&self, name: &str) -> Result<Device>;

    /// Apply a device configuration atomically
    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> Result<()>;
}
