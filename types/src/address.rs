// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// Network endpoint of a subinode. Only routable IPv4 endpoints are valid
/// for announcements; everything else is carried for display purposes only.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NetAddress(pub SocketAddr);

impl NetAddress {
    pub fn new_v4(ip: Ipv4Addr, port: u16) -> Self {
        NetAddress(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    /// Private (RFC 1918) or loopback endpoint, never relayed in directories.
    pub fn is_local(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
            IpAddr::V6(ip) => ip.is_loopback(),
        }
    }

    /// Publicly routable endpoint.
    pub fn is_routable(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_unspecified()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
            }
            IpAddr::V6(_) => false,
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetAddress({})", self.0)
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        NetAddress(addr)
    }
}

impl FromStr for NetAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NetAddress(s.parse()?))
    }
}
