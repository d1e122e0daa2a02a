//! Host addresses and listen probing
//!
//! An [`IpAddress`] is built either from a configuration string (a graphics
//! `listen` attribute, a qemu.conf value, a virtual network definition) or
//! from host interface enumeration. Anything that does not parse as an IPv4
//! or IPv6 literal is kept as an opaque hostname rather than rejected.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Default number of connect attempts made by [`IpAddress::listening_on`]
pub const DEFAULT_MAX_RETRY: u32 = 30;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Address family of an [`IpAddress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AddrFamily {
    /// IPv4 literal
    Ipv4,
    /// IPv6 literal, possibly with a zone
    Ipv6,
    /// Anything that failed to parse as an IP literal
    Hostname,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Host {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Name(String),
}

/// A single host address as seen by the SPICE server.
///
/// Two addresses are equal when their family and normalized address match,
/// and, if *both* sides know their owning interface, the interfaces match
/// too. An address read from configuration therefore compares equal to the
/// same address found on any interface. The IPv6 scope only shows up in the
/// rendered `addr%scope` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "AddressRepr", from = "AddressRepr")]
pub struct IpAddress {
    raw: String,
    host: Host,
    scope: u32,
    iface: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct AddressRepr {
    address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iface: Option<String>,
}

impl From<IpAddress> for AddressRepr {
    fn from(addr: IpAddress) -> Self {
        Self {
            address: addr.literal(),
            iface: addr.iface,
        }
    }
}

impl From<AddressRepr> for IpAddress {
    fn from(repr: AddressRepr) -> Self {
        let mut addr = IpAddress::parse(&repr.address);
        if repr.iface.is_some() {
            addr.iface = repr.iface;
        }
        addr
    }
}

impl IpAddress {
    /// Parse an address from configuration text.
    ///
    /// Text containing `:` is treated as IPv6 with an optional `%zone`
    /// suffix; the zone is either a numeric index or an interface name.
    /// Everything else is tried as IPv4. Failures fall back to a hostname.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.contains(':') {
            let (addr, zone) = match s.split_once('%') {
                Some((addr, zone)) => (addr, Some(zone)),
                None => (s, None),
            };
            if let Ok(ip) = addr.parse::<Ipv6Addr>() {
                let (scope, iface) = zone.map(resolve_zone).unwrap_or((0, None));
                return Self {
                    raw: s.to_owned(),
                    host: Host::V6(ip),
                    scope,
                    iface,
                };
            }
        } else if let Ok(ip) = s.parse::<Ipv4Addr>() {
            return Self {
                raw: s.to_owned(),
                host: Host::V4(ip),
                scope: 0,
                iface: None,
            };
        }
        debug!("Treating {s:?} as a hostname");
        Self {
            raw: s.to_owned(),
            host: Host::Name(s.to_owned()),
            scope: 0,
            iface: None,
        }
    }

    /// Build an address found on a local interface
    pub fn from_interface(ip: IpAddr, iface: &str, scope: u32) -> Self {
        let host = match ip {
            IpAddr::V4(v4) => Host::V4(v4),
            IpAddr::V6(v6) => Host::V6(v6),
        };
        Self {
            raw: ip.to_string(),
            host,
            scope,
            iface: Some(iface.to_owned()),
        }
    }

    /// Address family
    pub fn family(&self) -> AddrFamily {
        match self.host {
            Host::V4(_) => AddrFamily::Ipv4,
            Host::V6(_) => AddrFamily::Ipv6,
            Host::Name(_) => AddrFamily::Hostname,
        }
    }

    /// The text this address was built from
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Normalized address text without any zone
    pub fn addr(&self) -> String {
        match &self.host {
            Host::V4(ip) => ip.to_string(),
            Host::V6(ip) => ip.to_string(),
            Host::Name(name) => name.clone(),
        }
    }

    /// Network-order packed form, `None` for hostnames
    pub fn packed(&self) -> Option<Vec<u8>> {
        match &self.host {
            Host::V4(ip) => Some(ip.octets().to_vec()),
            Host::V6(ip) => Some(ip.octets().to_vec()),
            Host::Name(_) => None,
        }
    }

    /// The parsed IP, `None` for hostnames
    pub fn ip(&self) -> Option<IpAddr> {
        match &self.host {
            Host::V4(ip) => Some(IpAddr::V4(*ip)),
            Host::V6(ip) => Some(IpAddr::V6(*ip)),
            Host::Name(_) => None,
        }
    }

    /// IPv6 zone index (0 when unset or not IPv6)
    pub fn scope(&self) -> u32 {
        self.scope
    }

    /// Owning interface, if known
    pub fn iface(&self) -> Option<&str> {
        self.iface.as_deref()
    }

    /// Form suitable for a libvirt `listen` attribute or a QEMU `addr=`.
    ///
    /// Unlike [`Display`](fmt::Display), a zero IPv6 scope is omitted.
    pub fn literal(&self) -> String {
        match &self.host {
            Host::V6(ip) if self.scope != 0 => format!("{ip}%{}", self.scope),
            _ => self.addr(),
        }
    }

    fn socket_addrs(&self, port: u16) -> Vec<SocketAddr> {
        match &self.host {
            Host::V4(ip) => vec![SocketAddr::new(IpAddr::V4(*ip), port)],
            Host::V6(ip) => vec![SocketAddr::V6(SocketAddrV6::new(*ip, port, 0, self.scope))],
            Host::Name(name) => match (name.as_str(), port).to_socket_addrs() {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    debug!("Failed to resolve {name}: {e}");
                    Vec::new()
                }
            },
        }
    }

    /// The concrete address a bind to this one ends up on.
    ///
    /// Literals resolve to themselves. A hostname resolves to the first
    /// `getaddrinfo` result, which is the one QEMU binds; `None` when it
    /// does not resolve at all.
    pub fn resolve(&self) -> Option<IpAddress> {
        match &self.host {
            Host::Name(name) => {
                let first = self.socket_addrs(0).into_iter().next()?;
                let resolved = match first {
                    SocketAddr::V4(sa) => IpAddress::parse(&sa.ip().to_string()),
                    SocketAddr::V6(sa) => Self {
                        raw: sa.ip().to_string(),
                        host: Host::V6(*sa.ip()),
                        scope: sa.scope_id(),
                        iface: None,
                    },
                };
                debug!("{name} resolves to {resolved}");
                Some(resolved)
            }
            _ => Some(self.clone()),
        }
    }

    /// Check whether something accepts TCP connections on `port`.
    ///
    /// Each attempt uses a one second connect timeout. Only EAGAIN-class
    /// errors are retried (up to `max_retry` attempts); refusal or any other
    /// error means "not listening".
    pub fn listening_on(&self, port: u16, max_retry: u32) -> bool {
        self.socket_addrs(port)
            .iter()
            .any(|target| probe_connect(target, max_retry))
    }
}

fn resolve_zone(zone: &str) -> (u32, Option<String>) {
    if let Ok(index) = zone.parse::<u32>() {
        return (index, None);
    }
    match nix::net::if_::if_nametoindex(zone) {
        Ok(index) => (index, Some(zone.to_owned())),
        Err(e) => {
            debug!("Unknown interface {zone} in IPv6 zone: {e}");
            (0, Some(zone.to_owned()))
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EAGAIN)
}

fn probe_connect(target: &SocketAddr, max_retry: u32) -> bool {
    for attempt in 0..max_retry {
        match TcpStream::connect_timeout(target, CONNECT_TIMEOUT) {
            Ok(_) => return true,
            Err(e) if is_transient(&e) => {
                trace!("Connect to {target} temporarily unavailable (attempt {attempt}): {e}");
                std::thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                trace!("Nothing listening on {target}: {e}");
                return false;
            }
        }
    }
    false
}

impl PartialEq for IpAddress {
    fn eq(&self, other: &Self) -> bool {
        if self.host != other.host {
            return false;
        }
        match (&self.iface, &other.iface) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl Eq for IpAddress {}

impl Hash for IpAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::V6(ip) => write!(f, "{ip}%{}", self.scope),
            Host::V4(ip) => write!(f, "{ip}"),
            Host::Name(name) => f.write_str(name),
        }
    }
}

/// Answers "is anything listening on this address and port".
///
/// Both the port allocator and the verifier go through this seam so that
/// prediction logic can be exercised without touching real sockets.
pub trait ListenProbe {
    /// Whether `addr:port` currently accepts connections
    fn listening_on(&self, addr: &IpAddress, port: u16) -> bool;
}

impl<P: ListenProbe + ?Sized> ListenProbe for &P {
    fn listening_on(&self, addr: &IpAddress, port: u16) -> bool {
        (**self).listening_on(addr, port)
    }
}

/// Probe by opening TCP connections
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    /// Attempts per address on transient errors
    pub max_retry: u32,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

impl ListenProbe for TcpProbe {
    fn listening_on(&self, addr: &IpAddress, port: u16) -> bool {
        addr.listening_on(port, self.max_retry)
    }
}
