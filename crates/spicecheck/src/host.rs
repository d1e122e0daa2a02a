//! Host network enumeration
//!
//! IPv4 addresses come from `getifaddrs(3)`, IPv6 addresses (with their
//! interface index, used as the connect scope) from `/proc/net/if_inet6`.
//! The result is a snapshot; prediction never refreshes it mid-scenario.

use std::net::{IpAddr, Ipv6Addr, SocketAddrV4};

use color_eyre::eyre::{bail, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::{AddrFamily, IpAddress};

/// Kernel table of configured IPv6 addresses
pub const IF_INET6_PATH: &str = "/proc/net/if_inet6";

/// All addresses configured on the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAddresses {
    /// IPv4 addresses with their owning interface
    pub ipv4: Vec<IpAddress>,
    /// IPv6 addresses with owning interface and scope
    pub ipv6: Vec<IpAddress>,
}

impl HostAddresses {
    /// Build a snapshot from known addresses
    pub fn new(ipv4: Vec<IpAddress>, ipv6: Vec<IpAddress>) -> Self {
        Self { ipv4, ipv6 }
    }

    /// Enumerate the addresses of the running host
    pub fn enumerate() -> Result<Self> {
        let ipv4 = ipv4_addresses()?;
        let ipv6 = match std::fs::read_to_string(IF_INET6_PATH) {
            Ok(content) => parse_if_inet6(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{IF_INET6_PATH} not present, assuming IPv6 is disabled");
                Vec::new()
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {IF_INET6_PATH}")),
        };
        debug!(
            "Enumerated {} IPv4 and {} IPv6 host addresses",
            ipv4.len(),
            ipv6.len()
        );
        Ok(Self { ipv4, ipv6 })
    }

    /// Every address, IPv4 first
    pub fn all(&self) -> impl Iterator<Item = &IpAddress> {
        self.ipv4.iter().chain(self.ipv6.iter())
    }

    /// Addresses of one family; hostnames never appear in a snapshot
    pub fn of_family(&self, family: AddrFamily) -> &[IpAddress] {
        match family {
            AddrFamily::Ipv4 => &self.ipv4,
            AddrFamily::Ipv6 => &self.ipv6,
            AddrFamily::Hostname => &[],
        }
    }

    /// Whether the host has this address
    pub fn contains(&self, addr: &IpAddress) -> bool {
        self.all().any(|a| a == addr)
    }
}

fn ipv4_addresses() -> Result<Vec<IpAddress>> {
    let ifaddrs = nix::ifaddrs::getifaddrs().context("Failed to enumerate host interfaces")?;
    let mut addrs = Vec::new();
    for ifaddr in ifaddrs {
        let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let ip = *SocketAddrV4::from(*sin).ip();
        addrs.push(IpAddress::from_interface(
            IpAddr::V4(ip),
            &ifaddr.interface_name,
            0,
        ));
    }
    Ok(addrs)
}

/// Parse the contents of `/proc/net/if_inet6`.
///
/// Each line holds the address as 32 hex digits, the interface index (hex),
/// prefix length, scope, flags and the interface name.
pub fn parse_if_inet6(content: &str) -> Result<Vec<IpAddress>> {
    let mut addrs = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [hex, dev_no, _prefix, _scope, _flags, iface] = fields.as_slice() else {
            bail!("Malformed {IF_INET6_PATH} line: {line:?}");
        };
        if hex.len() != 32 {
            bail!("Malformed IPv6 address {hex:?} in {IF_INET6_PATH}");
        }
        let raw = u128::from_str_radix(hex, 16)
            .with_context(|| format!("Invalid IPv6 address {hex:?}"))?;
        let scope = u32::from_str_radix(dev_no, 16)
            .with_context(|| format!("Invalid interface index {dev_no:?}"))?;
        addrs.push(IpAddress::from_interface(
            IpAddr::V6(Ipv6Addr::from(raw)),
            iface,
            scope,
        ));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    const IF_INET6: &str = indoc! {"
        00000000000000000000000000000001 01 80 10 80       lo
        fe80000000000000505400fffe12a3b4 02 40 20 80     eth0
        fd000000000000000000000000000001 0a 40 00 80   virbr1
    "};

    #[test]
    fn test_parse_if_inet6() {
        let addrs = parse_if_inet6(IF_INET6).unwrap();
        assert_eq!(addrs.len(), 3);

        assert_eq!(addrs[0].addr(), "::1");
        assert_eq!(addrs[0].iface(), Some("lo"));
        assert_eq!(addrs[0].scope(), 1);

        assert_eq!(addrs[1].addr(), "fe80::5054:ff:fe12:a3b4");
        assert_eq!(addrs[1].iface(), Some("eth0"));
        assert_eq!(addrs[1].to_string(), "fe80::5054:ff:fe12:a3b4%2");

        assert_eq!(addrs[2].addr(), "fd00::1");
        assert_eq!(addrs[2].scope(), 10);
    }

    #[test]
    fn test_parse_if_inet6_malformed() {
        assert!(parse_if_inet6("00000000000000000000000000000001 01 80\n").is_err());
        assert!(parse_if_inet6("0001 01 80 10 80 lo\n").is_err());
        assert!(parse_if_inet6("").unwrap().is_empty());
    }

    #[test]
    fn test_contains_and_family() {
        let host = HostAddresses::new(
            vec![IpAddress::from_interface("10.0.0.5".parse().unwrap(), "eth0", 0)],
            parse_if_inet6(IF_INET6).unwrap(),
        );
        assert!(host.contains(&IpAddress::parse("10.0.0.5")));
        assert!(host.contains(&IpAddress::parse("0:0:0:0:0:0:0:1")));
        assert!(!host.contains(&IpAddress::parse("10.0.0.6")));
        assert!(!host.contains(&IpAddress::parse("example.com")));
        assert_eq!(host.of_family(AddrFamily::Ipv4).len(), 1);
        assert_eq!(host.of_family(AddrFamily::Ipv6).len(), 3);
        assert!(host.of_family(AddrFamily::Hostname).is_empty());
        assert_eq!(host.all().count(), 4);
    }

    #[test]
    fn test_enumerate_has_loopback() {
        let host = HostAddresses::enumerate().unwrap();
        assert!(host.contains(&IpAddress::parse("127.0.0.1")));
    }
}
