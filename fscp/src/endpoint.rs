/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A normalized peer address.
///
/// Endpoints are the identity key for all per-peer state, so an IPv4 address
/// and its IPv4-mapped-IPv6 form must collapse to the same value; a
/// dual-stack socket reports v4 senders in mapped form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn normalize(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => Self(SocketAddr::V4(SocketAddrV4::new(v4, v6.port()))),
                None => Self(addr),
            },
            SocketAddr::V4(_) => Self(addr),
        }
    }

    #[inline(always)]
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    #[inline(always)]
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::normalize(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A CIDR block, used for the never_contact exclusion list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix <= max {
            Some(Self { addr, prefix })
        } else {
            None
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        // Fold mapped addresses so a v4 block also matches mapped-v6 senders.
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_match(&net.octets(), &ip.octets(), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_match(&net.octets(), &ip.octets(), self.prefix)
            }
            _ => false,
        }
    }
}

fn prefix_match(net: &[u8], ip: &[u8], prefix: u8) -> bool {
    let full = (prefix / 8) as usize;
    if net[..full] != ip[..full] {
        return false;
    }
    let rem = prefix % 8;
    if rem == 0 {
        return true;
    }
    let mask = 0xff_u8 << (8 - rem);
    (net[full] & mask) == (ip[full] & mask)
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpNet {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr = IpAddr::from_str(addr)?;
                let prefix = u8::from_str(prefix).unwrap_or(u8::MAX);
                IpNet::new(addr, prefix).ok_or_else(bad_prefix_error)
            }
            None => {
                // A bare address is a host route.
                let addr = IpAddr::from_str(s)?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                Ok(IpNet::new(addr, prefix).unwrap())
            }
        }
    }
}

// AddrParseError has no public constructor; provoke one for the invalid
// prefix case so FromStr keeps a single error type.
fn bad_prefix_error() -> std::net::AddrParseError {
    IpAddr::from_str("").unwrap_err()
}

impl Serialize for IpNet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        IpNet::from_str(&s).map_err(|_| D::Error::custom("invalid CIDR block"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn mapped_v6_folds_to_v4() {
        let v4: SocketAddr = "192.0.2.1:12000".parse().unwrap();
        let mapped = SocketAddr::new(IpAddr::V6(Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped()), 12000);
        assert_eq!(Endpoint::normalize(v4), Endpoint::normalize(mapped));
    }

    #[test]
    fn plain_v6_is_untouched() {
        let v6: SocketAddr = "[2001:db8::1]:12000".parse().unwrap();
        assert_eq!(Endpoint::normalize(v6).socket_addr(), v6);
    }

    #[test]
    fn cidr_contains() {
        let net: IpNet = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        // Mapped form of a contained address matches too.
        assert!(net.contains(IpAddr::V6(Ipv4Addr::new(10, 9, 8, 7).to_ipv6_mapped())));

        let odd: IpNet = "192.168.128.0/18".parse().unwrap();
        assert!(odd.contains("192.168.129.1".parse().unwrap()));
        assert!(!odd.contains("192.168.192.1".parse().unwrap()));

        let v6net: IpNet = "2001:db8::/32".parse().unwrap();
        assert!(v6net.contains("2001:db8:1::1".parse().unwrap()));
        assert!(!v6net.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn cidr_parsing() {
        assert!("10.0.0.0/33".parse::<IpNet>().is_err());
        assert!("not-an-addr/8".parse::<IpNet>().is_err());
        let host: IpNet = "192.0.2.7".parse().unwrap();
        assert!(host.contains("192.0.2.7".parse().unwrap()));
        assert!(!host.contains("192.0.2.8".parse().unwrap()));
    }
}
