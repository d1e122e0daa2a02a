//! Predict and verify how libvirt brings up a SPICE display
//!
//! Given a graphics configuration and the state of the host, [`predict`]
//! works out which addresses and ports the SPICE server should listen on,
//! which `-spice` options QEMU should receive, and whether startup should
//! fail at all. [`verify`] then checks a running domain against that.

pub mod address;
pub mod allocator;
pub mod cmdext;
pub mod config;
pub mod domain;
pub mod error;
pub mod host;
pub mod network;
pub mod predict;
pub mod procinfo;
pub mod tls;
pub mod verify;
pub mod xml_utils;

#[cfg(test)]
pub(crate) mod testutil {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use crate::address::{IpAddress, ListenProbe};
    use crate::host::HostAddresses;

    /// Host with one IPv4 address and one link-local IPv6 address on eth0
    pub(crate) fn scenario_host() -> HostAddresses {
        HostAddresses::new(
            vec![IpAddress::from_interface(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
                "eth0",
                0,
            )],
            vec![IpAddress::from_interface(
                IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
                "eth0",
                2,
            )],
        )
    }

    /// Probe reporting a fixed set of listening endpoints
    #[derive(Debug, Default)]
    pub(crate) struct BusyPorts(Vec<(IpAddress, u16)>);

    impl BusyPorts {
        pub(crate) fn new<'a>(busy: impl IntoIterator<Item = (&'a str, u16)>) -> Self {
            Self(
                busy.into_iter()
                    .map(|(addr, port)| (IpAddress::parse(addr), port))
                    .collect(),
            )
        }
    }

    impl ListenProbe for BusyPorts {
        fn listening_on(&self, addr: &IpAddress, port: u16) -> bool {
            self.0.iter().any(|(a, p)| a == addr && *p == port)
        }
    }
}
