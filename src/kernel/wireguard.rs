//! WireGuard control implementation of [`WireguardApi`].
//!
//! The control calls are synchronous; they run on the blocking pool so the
//! reconciler tasks stay responsive to shutdown.

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use wireguard_control::{
    AllowedIp, Backend, Device as WgDevice, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
};

use super::{Device, DeviceConfig, DevicePeer, WireguardApi};
use crate::key::PublicKey;
use crate::{Error, Result};

/// Production WireGuard device control via the kernel backend.
#[derive(Clone, Copy, Default)]
pub struct WireguardControl;

impl WireguardControl {
    /// Create a control handle.
    pub fn new() -> Self {
        Self
    }
}

fn interface_name(name: &str) -> Result<InterfaceName> {
    name.parse()
        .map_err(|_| Error::wireguard(format!("invalid interface name '{name}'")))
}

fn wg_err(err: io::Error) -> Error {
    Error::wireguard(err.to_string())
}

fn convert_device(device: WgDevice) -> Device {
    let peers = device
        .peers
        .into_iter()
        .map(|peer| DevicePeer {
            public_key: PublicKey::from(peer.config.public_key.0),
            endpoint: peer.config.endpoint,
            allowed_ips: peer
                .config
                .allowed_ips
                .iter()
                .filter_map(|ip| match ip.address {
                    IpAddr::V4(addr) => Ipv4Net::new(addr, ip.cidr).ok(),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            last_handshake: peer.stats.last_handshake_time,
            rx_bytes: peer.stats.rx_bytes,
            tx_bytes: peer.stats.tx_bytes,
        })
        .collect();

    Device {
        listen_port: device.listen_port,
        peers,
    }
}

fn build_update(config: &DeviceConfig) -> DeviceUpdate {
    let mut update = DeviceUpdate::new()
        .set_private_key(Key(*config.private_key.as_bytes()))
        .set_listen_port(config.listen_port);

    for peer in &config.peers {
        let key = Key(*peer.public_key.as_bytes());

        if peer.remove {
            update = update.remove_peer_by_key(&key);
            continue;
        }

        let allowed: Vec<AllowedIp> = peer
            .allowed_ips
            .iter()
            .map(|net| AllowedIp {
                address: IpAddr::V4(net.addr()),
                cidr: net.prefix_len(),
            })
            .collect();

        let mut builder = PeerConfigBuilder::new(&key)
            .replace_allowed_ips()
            .add_allowed_ips(&allowed);
        if let Some(endpoint) = peer.endpoint {
            builder = builder.set_endpoint(endpoint);
        }

        update = update.add_peer(builder);
    }

    update
}

#[async_trait]
impl WireguardApi for WireguardControl {
    async fn device(&self, name: &str) -> Result<Device> {
        let iface = interface_name(name)?;

        let device = tokio::task::spawn_blocking(move || WgDevice::get(&iface, Backend::Kernel))
            .await
            .map_err(|e| Error::wireguard(format!("control task failed: {e}")))?
            .map_err(wg_err)?;

        Ok(convert_device(device))
    }

    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        let iface = interface_name(name)?;
        let update = build_update(config);

        tokio::task::spawn_blocking(move || update.apply(&iface, Backend::Kernel))
            .await
            .map_err(|e| Error::wireguard(format!("control task failed: {e}")))?
            .map_err(wg_err)
    }
}
