//! Which host addresses the SPICE server should bind

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::{AddrFamily, IpAddress};
use crate::config::{ListenType, QemuConf, SpiceConfig};
use crate::host::HostAddresses;

/// Placeholder asking for any IPv4 address of the host
pub const VALID_IPV4: &str = "valid_ipv4";
/// Placeholder asking for any IPv6 address of the host
pub const VALID_IPV6: &str = "valid_ipv6";
/// libvirt's listen address when nothing is configured
pub const LOOPBACK: &str = "127.0.0.1";

const WILDCARD_IPV4: &str = "0.0.0.0";
const WILDCARD_IPV6: &str = "::";

/// Predicted listen configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listen {
    /// Host addresses that should accept connections
    pub expected_ips: Vec<IpAddress>,
    /// Address the graphics device should be configured with; this is
    /// where a random `valid_ipv4`/`valid_ipv6` choice is recorded
    pub listen_address: String,
}

/// Predict the listen addresses for `config`.
///
/// `network_ip` is the address of the virtual network named by
/// `listen_network`, required when the listen type is `network`.
pub fn expected_listen<R: Rng + ?Sized>(
    config: &SpiceConfig,
    qemu_conf: &QemuConf,
    host: &HostAddresses,
    network_ip: Option<&IpAddress>,
    rng: &mut R,
) -> Result<Listen> {
    if config.listen_type == Some(ListenType::Network) {
        let ip = network_ip.ok_or_else(|| {
            eyre!(
                "Listen type is network but no address is known for network {:?}",
                config.listen_network
            )
        })?;
        return Ok(Listen {
            expected_ips: vec![ip.clone()],
            listen_address: ip.literal(),
        });
    }

    let configured = match config.listen_type {
        Some(ListenType::Address) => config.listen_address.as_deref(),
        _ => config.listen.as_deref(),
    };
    let literal = configured
        .or(qemu_conf.spice_listen.as_deref())
        .unwrap_or(LOOPBACK);

    let listen = match literal {
        VALID_IPV4 => pick_random(host, AddrFamily::Ipv4, rng)?,
        VALID_IPV6 => pick_random(host, AddrFamily::Ipv6, rng)?,
        WILDCARD_IPV4 => Listen {
            expected_ips: host.ipv4.clone(),
            listen_address: literal.to_owned(),
        },
        WILDCARD_IPV6 => Listen {
            expected_ips: host.all().cloned().collect(),
            listen_address: literal.to_owned(),
        },
        other => {
            // A hostname is checked at the address QEMU binds; one that does
            // not resolve stays as is and can never be bound
            let addr = IpAddress::parse(other);
            let resolved = addr.resolve();
            Listen {
                expected_ips: vec![resolved.unwrap_or(addr)],
                listen_address: other.to_owned(),
            }
        }
    };
    debug!(
        "Listening on {} expected at {} address(es)",
        listen.listen_address,
        listen.expected_ips.len()
    );
    Ok(listen)
}

fn pick_random<R: Rng + ?Sized>(
    host: &HostAddresses,
    family: AddrFamily,
    rng: &mut R,
) -> Result<Listen> {
    let chosen = host
        .of_family(family)
        .choose(rng)
        .ok_or_else(|| eyre!("Host has no {family} address to listen on"))
        .context("Resolving random listen address")?;
    debug!("Picked {chosen} as listen address");
    Ok(Listen {
        expected_ips: vec![chosen.clone()],
        listen_address: chosen.literal(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scenario_host;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use similar_asserts::assert_eq;

    fn predict(config: &SpiceConfig, qemu_conf: &QemuConf) -> Result<Listen> {
        let mut rng = StdRng::seed_from_u64(7);
        expected_listen(config, qemu_conf, &scenario_host(), None, &mut rng)
    }

    #[test]
    fn test_defaults_to_loopback() {
        let listen = predict(&SpiceConfig::default(), &QemuConf::default()).unwrap();
        assert_eq!(listen.expected_ips, vec![IpAddress::parse("127.0.0.1")]);
        assert_eq!(listen.listen_address, "127.0.0.1");
    }

    #[test]
    fn test_qemu_conf_listen_fallback() {
        let qemu_conf = QemuConf {
            spice_listen: Some("10.0.0.5".into()),
            ..Default::default()
        };
        let listen = predict(&SpiceConfig::default(), &qemu_conf).unwrap();
        assert_eq!(listen.expected_ips, vec![IpAddress::parse("10.0.0.5")]);
    }

    #[test]
    fn test_ipv4_wildcard_is_every_ipv4_address() {
        let config = SpiceConfig {
            listen_type: Some(ListenType::Address),
            listen_address: Some("0.0.0.0".into()),
            listen: Some("::".into()),
            ..Default::default()
        };
        let listen = predict(&config, &QemuConf::default()).unwrap();
        assert_eq!(listen.expected_ips, scenario_host().ipv4);
        assert_eq!(listen.listen_address, "0.0.0.0");
    }

    #[test]
    fn test_ipv6_wildcard_is_every_address() {
        let config = SpiceConfig {
            listen: Some("::".into()),
            ..Default::default()
        };
        let listen = predict(&config, &QemuConf::default()).unwrap();
        let host = scenario_host();
        assert_eq!(listen.expected_ips, host.all().cloned().collect::<Vec<_>>());
    }

    #[test]
    fn test_random_choice_is_recorded() {
        let config = SpiceConfig {
            listen: Some(VALID_IPV6.into()),
            ..Default::default()
        };
        let listen = predict(&config, &QemuConf::default()).unwrap();
        assert_eq!(listen.expected_ips.len(), 1);
        assert!(scenario_host().ipv6.contains(&listen.expected_ips[0]));
        assert_eq!(listen.listen_address, listen.expected_ips[0].literal());

        let config = SpiceConfig {
            listen: Some(VALID_IPV4.into()),
            ..Default::default()
        };
        let listen = predict(&config, &QemuConf::default()).unwrap();
        assert!(scenario_host().ipv4.contains(&listen.expected_ips[0]));
    }

    #[test]
    fn test_random_choice_without_candidates() {
        let config = SpiceConfig {
            listen: Some(VALID_IPV6.into()),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let host = HostAddresses::new(scenario_host().ipv4, Vec::new());
        assert!(expected_listen(&config, &QemuConf::default(), &host, None, &mut rng).is_err());
    }

    #[test]
    fn test_network_listen() {
        let config = SpiceConfig {
            listen_type: Some(ListenType::Network),
            listen_network: Some("spicenet".into()),
            listen: Some("10.0.0.5".into()),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let network_ip = IpAddress::parse("192.168.150.1");
        let listen = expected_listen(
            &config,
            &QemuConf::default(),
            &scenario_host(),
            Some(&network_ip),
            &mut rng,
        )
        .unwrap();
        assert_eq!(listen.expected_ips, vec![network_ip]);
        assert_eq!(listen.listen_address, "192.168.150.1");

        assert!(
            expected_listen(&config, &QemuConf::default(), &scenario_host(), None, &mut rng)
                .is_err()
        );
    }

    #[test]
    fn test_hostname_is_resolved() {
        let config = SpiceConfig {
            listen: Some("localhost".into()),
            ..Default::default()
        };
        let listen = predict(&config, &QemuConf::default()).unwrap();
        assert_eq!(listen.listen_address, "localhost");
        assert_eq!(listen.expected_ips.len(), 1);
        assert!(listen.expected_ips[0].ip().unwrap().is_loopback());

        let config = SpiceConfig {
            listen: Some("no-such-host.invalid".into()),
            ..Default::default()
        };
        let listen = predict(&config, &QemuConf::default()).unwrap();
        assert_eq!(listen.expected_ips[0].family(), AddrFamily::Hostname);
    }

    #[test]
    fn test_literal_address_kept_verbatim() {
        let config = SpiceConfig {
            listen: Some("192.0.2.77".into()),
            ..Default::default()
        };
        let listen = predict(&config, &QemuConf::default()).unwrap();
        assert_eq!(listen.expected_ips, vec![IpAddress::parse("192.0.2.77")]);
    }
}
