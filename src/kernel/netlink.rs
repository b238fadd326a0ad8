//! Netlink-backed implementation of [`LinkApi`].

use std::net::IpAddr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkMessage, State};
use rtnetlink::Handle;

use super::{LinkApi, LinkRef, LinkState, RouteSpec};
use crate::{Error, Result};

/// Production link/address/route operations over a shared netlink socket.
pub struct NetlinkHandle {
    handle: Handle,
}

impl NetlinkHandle {
    /// Open a netlink connection; its I/O runs on a background task for
    /// the lifetime of the process.
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| Error::netlink(e.to_string()))?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }
}

fn netlink_err(err: rtnetlink::Error) -> Error {
    Error::netlink(err.to_string())
}

fn is_not_found(err: &rtnetlink::Error) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -libc::ENODEV)
}

fn parse_link(fallback_name: &str, msg: LinkMessage) -> LinkRef {
    let mut link = LinkRef {
        index: msg.header.index,
        name: fallback_name.to_owned(),
        mtu: 0,
        oper_state: LinkState::Unknown,
    };

    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Mtu(mtu) => link.mtu = mtu,
            LinkAttribute::OperState(state) => {
                link.oper_state = match state {
                    State::Up => LinkState::Up,
                    State::Down => LinkState::Down,
                    _ => LinkState::Unknown,
                }
            }
            _ => {}
        }
    }

    link
}

#[async_trait]
impl LinkApi for NetlinkHandle {
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkRef>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_owned())
            .execute();

        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(parse_link(name, msg))),
            Ok(None) => Ok(None),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(netlink_err(err)),
        }
    }

    async fn link_add_wireguard(&self, name: &str) -> Result<()> {
        self.handle
            .link()
            .add()
            .wireguard(name.to_owned())
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn link_set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn addr_list(&self, index: u32) -> Result<Vec<Ipv4Net>> {
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut addresses = Vec::new();
        while let Some(msg) = messages.try_next().await.map_err(netlink_err)? {
            let prefix_len = msg.header.prefix_len;
            for attr in msg.attributes {
                if let AddressAttribute::Address(IpAddr::V4(addr)) = attr {
                    let net = Ipv4Net::new(addr, prefix_len)
                        .map_err(|e| Error::netlink(format!("invalid address prefix: {e}")))?;
                    addresses.push(net);
                }
            }
        }

        Ok(addresses)
    }

    async fn addr_add(&self, index: u32, addr: Ipv4Net) -> Result<()> {
        self.handle
            .address()
            .add(index, IpAddr::V4(addr.addr()), addr.prefix_len())
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<()> {
        self.handle
            .route()
            .add()
            .v4()
            .destination_prefix(route.destination.network(), route.destination.prefix_len())
            .output_interface(route.link_index)
            .table_id(route.table)
            .replace()
            .execute()
            .await
            .map_err(netlink_err)
    }
}
