//! Whether startup should fail, and with which error
//!
//! The result is a list of regular expressions; startup output matching any
//! of them counts as the predicted failure. An empty list predicts success.

use tracing::debug;

use crate::address::IpAddress;
use crate::config::{EnvState, SpiceConfig};
use crate::host::HostAddresses;

use super::channels::Channels;
use super::listen::Listen;
use super::ports::Ports;

/// TLS channels requested without a TLS port
pub const TLS_PORT_MISSING: &str = "TLS port( is)? not provided";
/// A TLS port configured while qemu.conf has `spice_tls = 0`
pub const TLS_DISABLED: &str = "TLS is disabled";
/// Plaintext channels requested without a plaintext port
pub const PLAIN_PORT_MISSING: &str = "plain port( is)? not provided";
/// Neither port ended up configured
pub const NO_PORT: &str = "neither port nor tls-port specified";
/// A port outside what QEMU accepts
pub const OUT_OF_RANGE: &str = "port is out of range";
/// The listening socket could not be bound
pub const BIND_FAILED: &str = r"binding socket to \S* failed";
/// The TLS certificate directory is incomplete
pub const CERTS_MISSING: &str = "Could not load certificates";

const PRIVILEGED_PORTS: std::ops::Range<i64> = 0..1024;
const VALID_PORTS: std::ops::RangeInclusive<i64> = -1..=65535;

/// Predicted failure signature
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failures {
    /// Patterns, in order, without duplicates
    pub patterns: Vec<String>,
    /// The port prediction after reconciling `defaultMode='any'`
    pub ports: Ports,
}

fn push(patterns: &mut Vec<String>, pattern: &str) {
    if !patterns.iter().any(|p| p == pattern) {
        patterns.push(pattern.to_owned());
    }
}

/// Predict the failure patterns for an already computed port prediction.
///
/// With `defaultMode='any'` a side that fails but has no channels routed
/// to it is dropped instead of reported, and its port is reset.
pub fn expected_failures(
    config: &SpiceConfig,
    env: &EnvState,
    channels: &Channels,
    listen: &Listen,
    ports: Ports,
    host: &HostAddresses,
) -> Failures {
    let mut ports = ports;

    let mut tls_failures = Vec::new();
    if ports.tls_port.is_none() && !channels.tls.is_empty() {
        tls_failures.push(TLS_PORT_MISSING);
    }
    if ports.tls_port.is_some() && !env.tls_enabled() {
        tls_failures.push(TLS_DISABLED);
    }
    let mut plain_failures = Vec::new();
    if ports.port.is_none() && !channels.plaintext.is_empty() {
        plain_failures.push(PLAIN_PORT_MISSING);
    }

    if config.any_mode() && (tls_failures.is_empty() || plain_failures.is_empty()) {
        if !tls_failures.is_empty() && channels.tls.is_empty() {
            debug!("No TLS channels in 'any' mode, TLS port will not be used");
            tls_failures.clear();
            ports.tls_port = None;
        }
        if !plain_failures.is_empty() && channels.plaintext.is_empty() {
            debug!("No plaintext channels in 'any' mode, plaintext port will not be used");
            plain_failures.clear();
            ports.port = None;
        }
    }

    let mut patterns = Vec::new();
    for pattern in plain_failures.into_iter().chain(tls_failures) {
        push(&mut patterns, pattern);
    }

    if ports.port.is_none() && ports.tls_port.is_none() {
        push(&mut patterns, NO_PORT);
        push(&mut patterns, OUT_OF_RANGE);
    }

    if let Some(port) = ports.port {
        check_port(&mut patterns, port);
    }
    if let Some(port) = ports.tls_port {
        if !check_port(&mut patterns, port) && !env.certs_available {
            push(&mut patterns, CERTS_MISSING);
        }
    }

    for ip in &listen.expected_ips {
        if !bindable(ip, host) {
            debug!("{ip} is not configured on this host");
            push(&mut patterns, BIND_FAILED);
        }
    }

    if !patterns.is_empty() {
        debug!("Expecting startup to fail with one of {patterns:?}");
    }
    Failures { patterns, ports }
}

/// Returns true when `port` alone already makes startup fail
fn check_port(patterns: &mut Vec<String>, port: i64) -> bool {
    if PRIVILEGED_PORTS.contains(&port) {
        push(patterns, BIND_FAILED);
        true
    } else if !VALID_PORTS.contains(&port) {
        push(patterns, OUT_OF_RANGE);
        true
    } else {
        false
    }
}

/// Loopback is always bindable. Hostnames reach this point only when they
/// did not resolve.
fn bindable(ip: &IpAddress, host: &HostAddresses) -> bool {
    match ip.ip() {
        Some(addr) if addr.is_loopback() => true,
        Some(_) => host.contains(ip),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_channels, DefaultMode, QemuConf};
    use crate::predict::channels::expected_channels;
    use crate::testutil::scenario_host;
    use similar_asserts::assert_eq;

    fn env(tls: bool, certs: bool) -> EnvState {
        EnvState {
            qemu_conf: QemuConf {
                spice_tls: tls,
                ..Default::default()
            },
            certs_available: certs,
        }
    }

    fn loopback() -> Listen {
        Listen {
            expected_ips: vec![IpAddress::parse("127.0.0.1")],
            listen_address: "127.0.0.1".into(),
        }
    }

    fn failures(config: &SpiceConfig, env: &EnvState, ports: Ports) -> Failures {
        let channels = expected_channels(config.default_mode, &config.channels);
        expected_failures(config, env, &channels, &loopback(), ports, &scenario_host())
    }

    fn ports(port: Option<i64>, tls_port: Option<i64>) -> Ports {
        Ports { port, tls_port }
    }

    #[test]
    fn test_success() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            ..Default::default()
        };
        let result = failures(&config, &env(true, true), ports(Some(5900), Some(5901)));
        assert!(result.patterns.is_empty());
        assert_eq!(result.ports, ports(Some(5900), Some(5901)));
    }

    #[test]
    fn test_no_ports() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            ..Default::default()
        };
        let result = failures(&config, &env(true, true), Ports::default());
        assert_eq!(result.patterns, vec![NO_PORT, OUT_OF_RANGE]);
    }

    #[test]
    fn test_tls_channel_without_tls_port() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Secure),
            ..Default::default()
        };
        let result = failures(&config, &env(true, true), ports(Some(5900), None));
        assert_eq!(result.patterns, vec![TLS_PORT_MISSING]);
    }

    #[test]
    fn test_plain_channel_without_port() {
        let config = SpiceConfig {
            channels: parse_channels("main:insecure").unwrap(),
            ..Default::default()
        };
        let result = failures(&config, &env(true, true), ports(None, Some(5901)));
        assert_eq!(result.patterns, vec![PLAIN_PORT_MISSING]);
    }

    #[test]
    fn test_tls_disabled() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Secure),
            ..Default::default()
        };
        let result = failures(&config, &env(false, true), ports(None, Some(5900)));
        assert_eq!(result.patterns, vec![TLS_DISABLED]);
    }

    #[test]
    fn test_any_mode_drops_unused_tls_side() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            ..Default::default()
        };
        let result = failures(&config, &env(false, true), ports(Some(5900), Some(5901)));
        assert!(result.patterns.is_empty());
        assert_eq!(result.ports, ports(Some(5900), None));
    }

    #[test]
    fn test_any_mode_keeps_used_tls_side() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            channels: parse_channels("main:secure").unwrap(),
            ..Default::default()
        };
        let result = failures(&config, &env(false, true), ports(Some(5900), Some(5901)));
        assert_eq!(result.patterns, vec![TLS_DISABLED]);
        assert_eq!(result.ports.tls_port, Some(5901));
    }

    #[test]
    fn test_any_mode_reports_both_sides() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            channels: parse_channels("main:insecure").unwrap(),
            ..Default::default()
        };
        let result = failures(&config, &env(false, true), ports(None, Some(5901)));
        assert_eq!(result.patterns, vec![PLAIN_PORT_MISSING, TLS_DISABLED]);
        assert_eq!(result.ports.tls_port, Some(5901));
    }

    #[test]
    fn test_port_ranges() {
        let config = SpiceConfig::default();
        let result = failures(&config, &env(true, true), ports(Some(80), None));
        assert_eq!(result.patterns, vec![BIND_FAILED]);

        let result = failures(&config, &env(true, true), ports(Some(70000), None));
        assert_eq!(result.patterns, vec![OUT_OF_RANGE]);

        let result = failures(&config, &env(true, false), ports(Some(5900), Some(5901)));
        assert_eq!(result.patterns, vec![CERTS_MISSING]);

        let result = failures(&config, &env(true, false), ports(None, Some(443)));
        assert_eq!(result.patterns, vec![BIND_FAILED]);
    }

    #[test]
    fn test_listen_address_not_on_host() {
        let config = SpiceConfig::default();
        let listen = Listen {
            expected_ips: vec![IpAddress::parse("192.0.2.1"), IpAddress::parse("10.0.0.5")],
            listen_address: "192.0.2.1".into(),
        };
        let channels = Channels::default();
        let result = expected_failures(
            &config,
            &env(true, true),
            &channels,
            &listen,
            ports(Some(5900), None),
            &scenario_host(),
        );
        assert_eq!(result.patterns, vec![BIND_FAILED]);
    }

    #[test]
    fn test_unresolved_hostname_cannot_bind() {
        let listen = Listen {
            expected_ips: vec![IpAddress::parse("no-such-host.invalid")],
            listen_address: "no-such-host.invalid".into(),
        };
        let result = expected_failures(
            &SpiceConfig::default(),
            &env(true, true),
            &Channels::default(),
            &listen,
            ports(Some(5900), None),
            &scenario_host(),
        );
        assert_eq!(result.patterns, vec![BIND_FAILED]);

        let listen = Listen {
            expected_ips: vec![IpAddress::parse("::1")],
            listen_address: "localhost".into(),
        };
        let result = expected_failures(
            &SpiceConfig::default(),
            &env(true, true),
            &Channels::default(),
            &listen,
            ports(Some(5900), None),
            &scenario_host(),
        );
        assert!(result.patterns.is_empty());
    }

    #[test]
    fn test_patterns_are_deduplicated() {
        let config = SpiceConfig::default();
        let listen = Listen {
            expected_ips: vec![IpAddress::parse("192.0.2.1")],
            listen_address: "192.0.2.1".into(),
        };
        let result = expected_failures(
            &config,
            &env(true, true),
            &Channels::default(),
            &listen,
            ports(Some(80), Some(443)),
            &scenario_host(),
        );
        assert_eq!(result.patterns, vec![BIND_FAILED]);
    }
}
