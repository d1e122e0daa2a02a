//! Comparing a [`Prediction`] with a running domain
//!
//! The observed side comes from the QEMU command line (the `-spice` option)
//! and from probing the host's addresses on the predicted ports.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use tracing::{debug, info};

use crate::address::{IpAddress, ListenProbe};
use crate::error::{ChannelKind, OptionChange, PredictionMismatch};
use crate::host::HostAddresses;
use crate::predict::options::FLAG_ON;
use crate::predict::Prediction;

const SPICE_ARG: &str = "-spice";
const TLS_CHANNEL: &str = "tls-channel";
const PLAINTEXT_CHANNEL: &str = "plaintext-channel";
/// Keys carrying the password, which never appears in a prediction
const PASSWORD_KEYS: &[&str] = &["password", "password-secret"];

/// The `-spice` option of a running QEMU, parsed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedSpice {
    /// Everything but channels and password; bare flags map to `on`
    pub options: BTreeMap<String, String>,
    /// `tls-channel=` values
    pub tls_channels: BTreeSet<String>,
    /// `plaintext-channel=` values
    pub plaintext_channels: BTreeSet<String>,
}

/// Split a QEMU option string on `,`, where `,,` is a literal comma
fn split_qemu_opts(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != ',' {
            current.push(c);
        } else if chars.peek() == Some(&',') {
            chars.next();
            current.push(',');
        } else {
            parts.push(std::mem::take(&mut current));
        }
    }
    parts.push(current);
    parts.retain(|p| !p.is_empty());
    parts
}

impl ObservedSpice {
    /// Parse the argument vector of a QEMU process
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let value = args
            .iter()
            .position(|a| a.as_ref() == SPICE_ARG)
            .and_then(|i| args.get(i + 1))
            .ok_or_else(|| eyre!("No {SPICE_ARG} option on the command line"))?;

        let mut observed = Self::default();
        for item in split_qemu_opts(value.as_ref()) {
            let (key, value) = match item.split_once('=') {
                Some((key, value)) => (key, value),
                None => (item.as_str(), FLAG_ON),
            };
            match key {
                TLS_CHANNEL => {
                    observed.tls_channels.insert(value.to_owned());
                }
                PLAINTEXT_CHANNEL => {
                    observed.plaintext_channels.insert(value.to_owned());
                }
                k if PASSWORD_KEYS.contains(&k) => debug!("Ignoring {k}"),
                _ => {
                    observed.options.insert(key.to_owned(), value.to_owned());
                }
            }
        }
        Ok(observed)
    }

    /// Parse a shell-quoted command line
    pub fn from_cmdline(cmdline: &str) -> Result<Self> {
        let args = shlex::split(cmdline)
            .ok_or_else(|| eyre!("Failed to split command line: {cmdline}"))?;
        Self::from_args(&args)
    }
}

/// The `-spice` options must be exactly the predicted ones
pub fn check_options(
    prediction: &Prediction,
    observed: &ObservedSpice,
) -> Result<(), PredictionMismatch> {
    let predicted = &prediction.options;
    let observed = &observed.options;
    let created: BTreeMap<String, String> = observed
        .iter()
        .filter(|(k, _)| !predicted.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let deleted: BTreeMap<String, String> = predicted
        .iter()
        .filter(|(k, _)| !observed.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let changed: Vec<OptionChange> = predicted
        .iter()
        .filter_map(|(k, p)| {
            let o = observed.get(k)?;
            (o != p).then(|| OptionChange {
                key: k.clone(),
                predicted: p.clone(),
                observed: o.clone(),
            })
        })
        .collect();
    if created.is_empty() && deleted.is_empty() && changed.is_empty() {
        Ok(())
    } else {
        Err(PredictionMismatch::Options {
            created,
            deleted,
            changed,
        })
    }
}

/// Both channel sets must equal the prediction
pub fn check_channels(
    prediction: &Prediction,
    observed: &ObservedSpice,
) -> Result<(), PredictionMismatch> {
    let sides = [
        (
            ChannelKind::Tls,
            &prediction.tls_channels,
            &observed.tls_channels,
        ),
        (
            ChannelKind::Plaintext,
            &prediction.plaintext_channels,
            &observed.plaintext_channels,
        ),
    ];
    for (kind, predicted, observed) in sides {
        let predicted: BTreeSet<String> = predicted.iter().cloned().collect();
        if &predicted != observed {
            return Err(PredictionMismatch::Channels {
                kind,
                predicted,
                observed: observed.clone(),
            });
        }
    }
    Ok(())
}

/// Check how startup went against the prediction.
///
/// `output` is the error output of the start attempt; it is only looked at
/// when startup failed.
pub fn check_startup(prediction: &Prediction, succeeded: bool, output: &str) -> Result<()> {
    match (prediction.expects_failure(), succeeded) {
        (false, true) => Ok(()),
        (false, false) => Err(PredictionMismatch::UnexpectedFailure {
            output: output.trim().to_owned(),
        }
        .into()),
        (true, true) => Err(PredictionMismatch::UnexpectedSuccess {
            patterns: prediction.fail_patterns.clone(),
        }
        .into()),
        (true, false) => {
            if prediction.matches_failure(output)? {
                info!("Startup failed as predicted");
                Ok(())
            } else {
                Err(PredictionMismatch::FailureSignature {
                    patterns: prediction.fail_patterns.clone(),
                    output: output.trim().to_owned(),
                }
                .into())
            }
        }
    }
}

/// Every host address must listen on the predicted ports exactly when it
/// is one of the expected addresses.
pub fn check_listening<P: ListenProbe>(
    prediction: &Prediction,
    host: &HostAddresses,
    probe: &P,
) -> Result<(), PredictionMismatch> {
    let extra: Vec<&IpAddress> = prediction
        .expected_ips
        .iter()
        .filter(|ip| !host.contains(ip))
        .collect();
    let ports = prediction.listen_ports();
    for addr in host.all().chain(extra) {
        let predicted = prediction.expected_ips.contains(addr);
        for &port in &ports {
            let observed = probe.listening_on(addr, port);
            debug!("{addr} port {port}: listening={observed}");
            if observed != predicted {
                return Err(PredictionMismatch::Listening {
                    addr: addr.to_string(),
                    port,
                    predicted,
                    observed,
                });
            }
        }
    }
    Ok(())
}

/// Verify a successfully started domain: options, channels, then sockets
pub fn verify<P: ListenProbe>(
    prediction: &Prediction,
    observed: &ObservedSpice,
    host: &HostAddresses,
    probe: &P,
) -> Result<()> {
    if prediction.expects_failure() {
        bail!(
            "Startup was predicted to fail with one of {:?}; nothing to verify",
            prediction.fail_patterns
        );
    }
    check_options(prediction, observed)?;
    check_channels(prediction, observed)?;
    check_listening(prediction, host, probe)?;
    info!("SPICE server matches the prediction");
    Ok(())
}
