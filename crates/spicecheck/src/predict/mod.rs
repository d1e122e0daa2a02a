//! Predicting how libvirt and QEMU bring up a SPICE server
//!
//! The stages run in a fixed order, each consuming what the earlier ones
//! produced:
//!
//! 1. [`channels`]: which channels are routed over TLS or plaintext
//! 2. [`listen`]: which host addresses should accept connections
//! 3. [`ports`]: which ports libvirt configures, via [`PortAllocator`]
//! 4. [`failure`]: whether startup fails, possibly correcting the ports
//! 5. [`options`]: the resulting `-spice` command line options
//!
//! The outputs are folded into one [`Prediction`], which can be written to
//! disk before the domain starts and checked by [`crate::verify`] afterwards.

use std::collections::BTreeMap;

use camino::Utf8Path;
use color_eyre::eyre::Context;
use color_eyre::Result;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::address::{IpAddress, ListenProbe, TcpProbe};
use crate::allocator::PortAllocator;
use crate::config::{EnvState, SpiceConfig};
use crate::host::HostAddresses;

pub mod channels;
pub mod failure;
pub mod listen;
pub mod options;
pub mod ports;

use self::ports::{port_setting, Ports};

/// Everything we expect of one scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    /// Addresses that should accept connections, in prediction order
    pub expected_ips: Vec<IpAddress>,
    /// Listen address the graphics device is configured with
    pub listen_address: String,
    /// Channels that must be routed over TLS
    pub tls_channels: Vec<String>,
    /// Channels that must be routed over plaintext
    pub plaintext_channels: Vec<String>,
    /// Plaintext port
    #[serde(with = "port_setting")]
    pub port: Option<i64>,
    /// TLS port
    #[serde(with = "port_setting")]
    pub tls_port: Option<i64>,
    /// Startup is expected to fail with output matching one of these
    pub fail_patterns: Vec<String>,
    /// Expected `-spice` options, channels and password excluded
    pub options: BTreeMap<String, String>,
}

impl Prediction {
    /// Whether startup is expected to fail.
    ///
    /// Sockets must not be verified when this returns true.
    pub fn expects_failure(&self) -> bool {
        !self.fail_patterns.is_empty()
    }

    /// Whether `output` matches any of the failure patterns
    pub fn matches_failure(&self, output: &str) -> Result<bool> {
        for pattern in &self.fail_patterns {
            let re = Regex::new(pattern)
                .with_context(|| format!("Invalid failure pattern {pattern:?}"))?;
            if re.is_match(output) {
                debug!("Output matches {pattern:?}");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The predicted ports, plaintext first
    pub fn ports(&self) -> Ports {
        Ports {
            port: self.port,
            tls_port: self.tls_port,
        }
    }

    /// Predicted ports a listener can actually be bound to
    pub fn listen_ports(&self) -> Vec<u16> {
        self.ports()
            .iter()
            .filter_map(|p| u16::try_from(p).ok())
            .filter(|&p| p != 0)
            .collect()
    }

    /// Read a prediction written by [`Prediction::save`]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prediction: {path}"))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse prediction: {path}"))
    }

    /// Write the prediction as JSON
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {path}"))
    }
}

/// Runs the prediction stages against one host and environment
#[derive(Debug)]
pub struct Predictor<'a, P> {
    env: &'a EnvState,
    host: &'a HostAddresses,
    network_ip: Option<IpAddress>,
    probe: P,
}

impl<'a> Predictor<'a, TcpProbe> {
    /// Predictor probing the real host for ports in use
    pub fn new(env: &'a EnvState, host: &'a HostAddresses) -> Self {
        Self {
            env,
            host,
            network_ip: None,
            probe: TcpProbe::default(),
        }
    }
}

impl<'a, P: ListenProbe> Predictor<'a, P> {
    /// Replace the probe used to find ports already in use
    pub fn with_probe<Q: ListenProbe>(self, probe: Q) -> Predictor<'a, Q> {
        Predictor {
            env: self.env,
            host: self.host,
            network_ip: self.network_ip,
            probe,
        }
    }

    /// Address of the virtual network used for `listen-type = "network"`
    pub fn with_network_ip(mut self, ip: IpAddress) -> Self {
        self.network_ip = Some(ip);
        self
    }

    /// Predict the outcome of starting a domain with `config`
    pub fn predict(&self, config: &SpiceConfig) -> Result<Prediction> {
        self.predict_with_rng(config, &mut rand::rng())
    }

    /// Like [`Predictor::predict`], drawing random listen addresses from `rng`
    #[instrument(level = "debug", skip_all)]
    pub fn predict_with_rng<R: Rng + ?Sized>(
        &self,
        config: &SpiceConfig,
        rng: &mut R,
    ) -> Result<Prediction> {
        let qemu_conf = &self.env.qemu_conf;
        let channels = channels::expected_channels(config.default_mode, &config.channels);
        let listen = listen::expected_listen(
            config,
            qemu_conf,
            self.host,
            self.network_ip.as_ref(),
            rng,
        )?;

        let mut allocator = PortAllocator::new(
            qemu_conf.remote_display_port_min,
            qemu_conf.remote_display_port_max,
            self.host.all().cloned().collect(),
            &self.probe,
        );
        let ports = ports::expected_ports(config, &channels, &mut allocator)
            .context("Predicting SPICE ports")?;

        let failures =
            failure::expected_failures(config, self.env, &channels, &listen, ports, self.host);
        let options = options::expected_options(config, self.env, &listen, &failures.ports);

        Ok(Prediction {
            expected_ips: listen.expected_ips,
            listen_address: listen.listen_address,
            tls_channels: channels.tls,
            plaintext_channels: channels.plaintext,
            port: failures.ports.port,
            tls_port: failures.ports.tls_port,
            fail_patterns: failures.patterns,
            options,
        })
    }
}
