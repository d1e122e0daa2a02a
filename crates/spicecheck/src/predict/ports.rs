//! Expected plaintext and TLS ports

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::ListenProbe;
use crate::allocator::PortAllocator;
use crate::config::{PortSetting, SpiceConfig};
use crate::error::AllocationError;

use super::channels::Channels;

/// Port used in the configuration to request automatic allocation
pub const AUTOPORT: i64 = -1;

/// Predicted ports; `None` means QEMU gets no such option
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    /// Plaintext `port`
    #[serde(with = "port_setting")]
    pub port: Option<i64>,
    /// `tls-port`
    #[serde(with = "port_setting")]
    pub tls_port: Option<i64>,
}

impl Ports {
    /// Ports that are set, plaintext first
    pub fn iter(&self) -> impl Iterator<Item = i64> {
        self.port.into_iter().chain(self.tls_port)
    }
}

/// Serialize `Option<i64>` with the `not_set` sentinel
pub(crate) mod port_setting {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::config::PortSetting;

    pub(crate) fn serialize<S: Serializer>(v: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
        PortSetting::from(*v).serialize(s)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(PortSetting::deserialize(d)?.resolve())
    }
}

/// Predict ports the way libvirt assigns them.
///
/// The plaintext port is allocated before the TLS port, so with a free range
/// the plaintext side gets the lower number.
pub fn expected_ports<P: ListenProbe>(
    config: &SpiceConfig,
    channels: &Channels,
    allocator: &mut PortAllocator<P>,
) -> Result<Ports, AllocationError> {
    let port = config.port.resolve();
    let tls_port = config.tls_port.resolve();
    let insecure_autoport = port == Some(AUTOPORT) || config.autoport();
    let secure_autoport = tls_port == Some(AUTOPORT) || config.autoport();

    // A fixed port on one side must not be handed to the other side
    for (fixed, autoport) in [(port, insecure_autoport), (tls_port, secure_autoport)] {
        if let (Some(p), false) = (fixed.and_then(|p| u16::try_from(p).ok()), autoport) {
            allocator.reserve(p);
        }
    }

    let mut ports = Ports { port, tls_port };
    if insecure_autoport {
        ports.port = if !channels.plaintext.is_empty() || config.any_mode() {
            Some(allocator.allocate()?.into())
        } else {
            None
        };
    }
    if secure_autoport {
        ports.tls_port = if !channels.tls.is_empty() || config.any_mode() {
            Some(allocator.allocate()?.into())
        } else {
            None
        };
    }

    // libvirt still binds something when autoport was asked for with no
    // channels routed anywhere
    if ports.port.is_none() && ports.tls_port.is_none() {
        if insecure_autoport {
            ports.port = Some(allocator.allocate()?.into());
        }
        if secure_autoport {
            ports.tls_port = Some(allocator.allocate()?.into());
        }
    }

    ports.port = ports.port.filter(|&p| p >= AUTOPORT);
    ports.tls_port = ports.tls_port.filter(|&p| p >= AUTOPORT);
    debug!(
        "Expecting port={} tls-port={}",
        PortSetting::from(ports.port),
        PortSetting::from(ports.tls_port)
    );
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::IpAddress;
    use crate::config::{DefaultMode, Toggle};
    use crate::predict::channels::expected_channels;
    use crate::testutil::BusyPorts;
    use similar_asserts::assert_eq;

    fn predict(config: &SpiceConfig) -> Result<Ports, AllocationError> {
        predict_with(config, &BusyPorts::default())
    }

    fn predict_with(config: &SpiceConfig, probe: &BusyPorts) -> Result<Ports, AllocationError> {
        let channels = expected_channels(config.default_mode, &config.channels);
        let mut allocator =
            PortAllocator::new(5900, 65535, vec![IpAddress::parse("127.0.0.1")], probe);
        expected_ports(config, &channels, &mut allocator)
    }

    #[test]
    fn test_nothing_requested() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            autoport: Some(Toggle::No),
            ..Default::default()
        };
        assert_eq!(predict(&config).unwrap(), Ports::default());
    }

    #[test]
    fn test_secure_autoport() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Secure),
            autoport: Some(Toggle::Yes),
            ..Default::default()
        };
        let ports = predict(&config).unwrap();
        assert_eq!(ports.port, None);
        assert_eq!(ports.tls_port, Some(5900));
    }

    #[test]
    fn test_any_mode_allocates_both_plaintext_first() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            autoport: Some(Toggle::Yes),
            ..Default::default()
        };
        let probe = BusyPorts::new([("127.0.0.1", 5900)]);
        let ports = predict_with(&config, &probe).unwrap();
        assert_eq!(ports.port, Some(5901));
        assert_eq!(ports.tls_port, Some(5902));
    }

    #[test]
    fn test_per_port_autoport() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Insecure),
            port: PortSetting::Value(-1),
            tls_port: PortSetting::Value(5999),
            ..Default::default()
        };
        let ports = predict(&config).unwrap();
        assert_eq!(ports.port, Some(5900));
        assert_eq!(ports.tls_port, Some(5999));
    }

    #[test]
    fn test_fixed_port_not_reallocated() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Secure),
            port: PortSetting::Value(5900),
            tls_port: PortSetting::Value(-1),
            ..Default::default()
        };
        let ports = predict(&config).unwrap();
        assert_eq!(ports.port, Some(5900));
        assert_eq!(ports.tls_port, Some(5901));

        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            port: PortSetting::Value(-1),
            tls_port: PortSetting::Value(5900),
            ..Default::default()
        };
        let ports = predict(&config).unwrap();
        assert_eq!(ports.port, Some(5901));
        assert_eq!(ports.tls_port, Some(5900));
    }

    #[test]
    fn test_autoport_overrides_fixed_port() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            autoport: Some(Toggle::Yes),
            port: PortSetting::Value(5905),
            ..Default::default()
        };
        let ports = predict(&config).unwrap();
        assert_eq!(ports.port, Some(5900));
        assert_eq!(ports.tls_port, Some(5901));
    }

    #[test]
    fn test_zero_is_not_set() {
        let config = SpiceConfig {
            port: PortSetting::Value(0),
            tls_port: PortSetting::Value(0),
            ..Default::default()
        };
        assert_eq!(predict(&config).unwrap(), Ports::default());
    }

    #[test]
    fn test_autoport_without_channels_forces_allocation() {
        let config = SpiceConfig {
            autoport: Some(Toggle::Yes),
            ..Default::default()
        };
        let ports = predict(&config).unwrap();
        assert_eq!(ports.port, Some(5900));
        assert_eq!(ports.tls_port, Some(5901));

        let config = SpiceConfig {
            tls_port: PortSetting::Value(-1),
            ..Default::default()
        };
        let ports = predict(&config).unwrap();
        assert_eq!(ports.port, None);
        assert_eq!(ports.tls_port, Some(5900));
    }

    #[test]
    fn test_explicit_values_kept_and_clamped() {
        let config = SpiceConfig {
            port: PortSetting::Value(80),
            tls_port: PortSetting::Value(-7),
            ..Default::default()
        };
        let ports = predict(&config).unwrap();
        assert_eq!(ports.port, Some(80));
        assert_eq!(ports.tls_port, None);

        let config = SpiceConfig {
            port: PortSetting::Value(70000),
            ..Default::default()
        };
        assert_eq!(predict(&config).unwrap().port, Some(70000));
    }

    #[test]
    fn test_overflow_is_surfaced() {
        let config = SpiceConfig {
            default_mode: Some(DefaultMode::Any),
            autoport: Some(Toggle::Yes),
            ..Default::default()
        };
        let channels = expected_channels(config.default_mode, &config.channels);
        let probe = BusyPorts::default();
        let mut allocator =
            PortAllocator::new(5900, 5900, vec![IpAddress::parse("127.0.0.1")], &probe);
        assert_eq!(
            expected_ports(&config, &channels, &mut allocator),
            Err(AllocationError::Overflow {
                port: 5901,
                max: 5900
            })
        );
    }

    #[test]
    fn test_serialized_with_sentinel() {
        let ports = Ports {
            port: Some(5900),
            tls_port: None,
        };
        let json = serde_json::to_string(&ports).unwrap();
        assert_eq!(json, r#"{"port":"5900","tls_port":"not_set"}"#);
        let back: Ports = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ports);
    }
}
