//! Integration tests for spicecheck
//!
//! Scenarios are predicted with the library, started as transient libvirt
//! domains and then verified against the running QEMU process. This needs a
//! libvirt daemon with the QEMU driver; `LIBVIRT_DEFAULT_URI` selects it.

use std::io::Write;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use tracing::info;

pub(crate) use integration_tests::{integration_test, resource_name, INTEGRATION_TESTS};
use spicecheck::address::{IpAddress, TcpProbe};
use spicecheck::config::{EnvState, QemuConf, SpiceConfig, QEMU_CONF_PATH};
use spicecheck::domain::DomainBuilder;
use spicecheck::host::HostAddresses;
use spicecheck::network::virsh_command;
use spicecheck::predict::{Prediction, Predictor};
use spicecheck::procinfo::{self, LIBVIRT_QEMU_RUN_DIR};
use spicecheck::verify::{check_startup, verify, ObservedSpice};

mod tests {
    pub mod cli;
    pub mod spice;
}

/// Get the path to the spicecheck binary, checking SPICECHECK_PATH first
pub(crate) fn get_spicecheck_command() -> Result<String> {
    if let Ok(path) = std::env::var("SPICECHECK_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/spicecheck", "target/release/spicecheck"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set SPICECHECK_PATH={path} to run using this binary"
        ));
    }
    Ok("spicecheck".to_owned())
}

/// A fresh name for a test domain or network
pub(crate) fn unique_name(label: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    resource_name(label, &id[..8])
}

/// Directory libvirt keeps QEMU pid files in
fn qemu_run_dir() -> Utf8PathBuf {
    std::env::var("SPICECHECK_QEMU_RUN_DIR")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|_| Utf8PathBuf::from(LIBVIRT_QEMU_RUN_DIR))
}

/// A running transient domain, destroyed on drop
#[derive(Debug)]
pub(crate) struct TransientDomain {
    name: String,
}

impl TransientDomain {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TransientDomain {
    fn drop(&mut self) {
        let _ = virsh_command(None)
            .args(["destroy", self.name.as_str()])
            .output();
    }
}

/// Result of `virsh create`
#[derive(Debug)]
pub(crate) struct Startup {
    /// Set when the domain came up
    pub domain: Option<TransientDomain>,
    /// Combined error output of the attempt
    pub output: String,
}

/// Start a transient domain from `xml`
pub(crate) fn start_domain(name: &str, xml: &str) -> Result<Startup> {
    let mut file = tempfile::Builder::new()
        .prefix("spicecheck-domain-")
        .suffix(".xml")
        .tempfile()?;
    file.write_all(xml.as_bytes())?;
    let output = virsh_command(None)
        .arg("create")
        .arg(file.path())
        .output()
        .context("Failed to run virsh create")?;
    let text = String::from_utf8_lossy(&output.stderr).into_owned();
    let domain = output.status.success().then(|| TransientDomain {
        name: name.to_owned(),
    });
    Ok(Startup {
        domain,
        output: text,
    })
}

/// Predict the host's outcome for `spice`
pub(crate) fn predict_on_host(
    spice: &SpiceConfig,
    network_ip: Option<IpAddress>,
) -> Result<(Prediction, HostAddresses)> {
    let host = HostAddresses::enumerate()?;
    let env = EnvState::probe(QemuConf::load(Utf8Path::new(QEMU_CONF_PATH))?);
    let mut predictor = Predictor::new(&env, &host);
    if let Some(ip) = network_ip {
        predictor = predictor.with_network_ip(ip);
    }
    let prediction = predictor.predict(spice)?;
    Ok((prediction, host))
}

/// Predict, start and verify one scenario
pub(crate) fn run_scenario(
    label: &str,
    spice: &SpiceConfig,
    network_ip: Option<IpAddress>,
) -> Result<()> {
    let (prediction, host) = predict_on_host(spice, network_ip)?;
    info!(
        "{label}: port={:?} tls_port={:?} failure={:?}",
        prediction.port, prediction.tls_port, prediction.fail_patterns
    );

    let name = unique_name(label);
    let xml = DomainBuilder::new()
        .with_name(&name)
        .with_spice(spice, &prediction.listen_address)
        .build_xml()?;
    let startup = start_domain(&name, &xml)?;
    check_startup(&prediction, startup.domain.is_some(), &startup.output)
        .with_context(|| format!("Starting {label}"))?;

    if let Some(domain) = &startup.domain {
        let pid = procinfo::domain_pid(&qemu_run_dir(), domain.name())?;
        let args = procinfo::process_args(pid)?;
        let observed = ObservedSpice::from_args(&args)?;
        verify(&prediction, &observed, &host, &TcpProbe::default())
            .with_context(|| format!("Verifying {label}"))?;
    }
    Ok(())
}

/// Whether a usable libvirt QEMU driver is reachable
pub(crate) fn libvirt_available() -> bool {
    Command::new("virsh")
        .arg("version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Send library logs to stderr, filtered by RUST_LOG and defaulting to 'info'
fn install_tracing() -> Result<()> {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init()?;
    Ok(())
}

fn main() {
    if let Err(e) = install_tracing() {
        eprintln!("Failed to set up logging: {e}");
    }
    let args = Arguments::from_args();

    // Collect tests from the distributed slice
    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    // Run the tests and exit with the result
    libtest_mimic::run(&args, tests).exit();
}
