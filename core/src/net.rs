//! Address primitives shared by the tables and the stack

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smoltcp::wire::{EthernetAddress, IpAddress, IpCidr, Ipv4Cidr, Ipv6Cidr};

use crate::error::{Error, Result};

/// An IPv4 or IPv6 network in CIDR notation
///
/// The address is always stored as the network address of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr(IpCidr);

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(Error::Validation(format!(
                "prefix length {} out of range for {}",
                prefix_len, addr
            )));
        }
        Ok(Self::from(IpCidr::new(IpAddress::from(addr), prefix_len)))
    }

    /// Network covering exactly one address
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
        Self(IpCidr::new(IpAddress::from(addr), prefix_len))
    }

    pub fn addr(&self) -> IpAddr {
        self.0.address().into()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.0, IpCidr::Ipv4(_))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.contains_addr(&IpAddress::from(ip))
    }

    /// True if `other` lies entirely within this network (including equality)
    pub fn contains_cidr(&self, other: &Self) -> bool {
        self.0.contains_subnet(&other.0)
    }

    /// Directed broadcast address, `None` for v6 and for /31 and /32
    pub fn broadcast(&self) -> Option<IpAddr> {
        match self.0 {
            IpCidr::Ipv4(c) => c.broadcast().map(IpAddr::V4),
            IpCidr::Ipv6(_) => None,
        }
    }
}

impl From<IpCidr> for Cidr {
    fn from(cidr: IpCidr) -> Self {
        match cidr {
            IpCidr::Ipv4(c) => Self(c.network().into()),
            IpCidr::Ipv6(c) => {
                // smoltcp only offers a network block for v4
                let len = u32::from(c.prefix_len());
                let mask = u128::MAX.checked_shl(128 - len).unwrap_or(0);
                let network = Ipv6Addr::from_bits(c.address().to_bits() & mask);
                Self(Ipv6Cidr::new(network, c.prefix_len()).into())
            }
        }
    }
}

impl From<Cidr> for IpCidr {
    fn from(cidr: Cidr) -> Self {
        cidr.0
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    /// A bare address is read as a host route
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.contains('/') {
            return Ok(Self::host(parse_ip(s)?));
        }
        IpCidr::from_str(s)
            .map(Self::from)
            .map_err(|_| Error::Validation(format!("invalid cidr: {}", s)))
    }
}

impl TryFrom<String> for Cidr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

pub fn parse_ip(s: &str) -> Result<IpAddr> {
    s.trim()
        .parse()
        .map_err(|_| Error::Validation(format!("invalid ip address: {}", s)))
}

/// Accepts `-` or `:` separated octets
pub fn parse_mac(s: &str) -> Result<EthernetAddress> {
    EthernetAddress::from_str(s.trim())
        .map_err(|_| Error::Validation(format!("invalid mac address: {}", s)))
}

/// Wildcard address of the same family, used for listen entries bound to any address
pub fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

pub fn wildcard_of(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(unspecified_like(addr.ip()), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_masks_host_bits() {
        let c: Cidr = "10.0.0.77/24".parse().unwrap();
        assert_eq!(c.addr(), "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(c.to_string(), "10.0.0.0/24");

        let c: Cidr = "fd00::1:2/112".parse().unwrap();
        assert_eq!(c.to_string(), "fd00::1:0/112");
        assert_eq!(c, "fd00::1:0/112".parse().unwrap());
    }

    #[test]
    fn test_cidr_host_route() {
        let c: Cidr = "10.0.0.9".parse().unwrap();
        assert_eq!(c.prefix_len(), 32);
        assert!(c.contains("10.0.0.9".parse().unwrap()));
        assert!(!c.contains("10.0.0.8".parse().unwrap()));
        assert_eq!("fd00::9".parse::<Cidr>().unwrap().prefix_len(), 128);
    }

    #[test]
    fn test_cidr_contains() {
        let c: Cidr = "10.0.0.0/24".parse().unwrap();
        assert!(c.contains("10.0.0.5".parse().unwrap()));
        assert!(!c.contains("10.0.1.5".parse().unwrap()));
        assert!(!c.contains("fd00::1".parse().unwrap()));

        let any: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_contains_cidr() {
        let wide: Cidr = "10.0.0.0/16".parse().unwrap();
        let narrow: Cidr = "10.0.3.0/24".parse().unwrap();
        assert!(wide.contains_cidr(&narrow));
        assert!(!narrow.contains_cidr(&wide));
        assert!(wide.contains_cidr(&wide));
        assert!(!wide.contains_cidr(&"fd00::/8".parse().unwrap()));
    }

    #[test]
    fn test_cidr_broadcast() {
        let c: Cidr = "10.0.0.0/24".parse().unwrap();
        assert_eq!(c.broadcast(), Some("10.0.0.255".parse().unwrap()));
        assert_eq!("10.0.0.9".parse::<Cidr>().unwrap().broadcast(), None);
        assert_eq!("fd00::/64".parse::<Cidr>().unwrap().broadcast(), None);
    }

    #[test]
    fn test_cidr_v6() {
        let c: Cidr = "fd00::/64".parse().unwrap();
        assert!(c.contains("fd00::1234".parse().unwrap()));
        assert!(!c.contains("fd01::1".parse().unwrap()));
        assert!("::/0".parse::<Cidr>().unwrap().contains("fd01::1".parse().unwrap()));
        assert!("fd00::/129".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_cidr_invalid() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
        assert!(Cidr::new("10.0.0.0".parse().unwrap(), 40).is_err());
    }

    #[test]
    fn test_cidr_serde() {
        let c: Cidr = serde_json::from_str("\"192.168.7.1/16\"").unwrap();
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"192.168.0.0/16\"");
        assert!(serde_json::from_str::<Cidr>("\"nope\"").is_err());
    }

    #[test]
    fn test_parse_mac() {
        let mac = parse_mac("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(mac.0, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(parse_mac("00-11-22-33-44-55").unwrap().0[5], 0x55);
        assert_eq!(mac.to_string(), "aa-bb-cc-dd-ee-ff");
        assert!(parse_mac("aa:bb:cc:dd:ee").is_err());
        assert!(parse_mac("aa:bb:cc:dd:ee:ff:00").is_err());
        assert!(parse_mac("zz:bb:cc:dd:ee:ff").is_err());
    }
}
