//! `spicecheck predict`

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::info;

use spicecheck::address::IpAddress;
use spicecheck::config::{ListenType, QemuConf, Scenario, QEMU_CONF_PATH};
use spicecheck::domain::DomainBuilder;
use spicecheck::host::HostAddresses;
use spicecheck::network::VirtualNetwork;
use spicecheck::predict::{Prediction, Predictor};

use super::OutputFormat;

/// Predict ports, listen addresses, options and failures of a scenario
#[derive(Debug, Parser)]
pub(crate) struct PredictOpts {
    /// Scenario file (TOML)
    pub(crate) scenario: Utf8PathBuf,

    /// qemu.conf to read when the scenario has no [qemu-conf] table
    #[clap(long, default_value = QEMU_CONF_PATH)]
    pub(crate) qemu_conf: Utf8PathBuf,

    /// Address of the listen network; looked up with virsh when omitted
    #[clap(long)]
    pub(crate) network_ip: Option<String>,

    /// Libvirt connection URI used for the network lookup
    #[clap(long)]
    pub(crate) connect: Option<String>,

    /// Write the prediction as JSON to this file
    #[clap(long, short = 'o')]
    pub(crate) output: Option<Utf8PathBuf>,

    /// Write a domain definition consistent with the prediction
    #[clap(long)]
    pub(crate) domain_xml: Option<Utf8PathBuf>,

    /// Domain name used in --domain-xml
    #[clap(long, default_value = "spicecheck")]
    pub(crate) domain_name: String,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub(crate) format: OutputFormat,
}

fn network_ip(opts: &PredictOpts, scenario: &Scenario) -> Result<Option<IpAddress>> {
    if let Some(ip) = &opts.network_ip {
        return Ok(Some(IpAddress::parse(ip)));
    }
    if scenario.spice.listen_type != Some(ListenType::Network) {
        return Ok(None);
    }
    let name = scenario
        .spice
        .listen_network
        .as_deref()
        .ok_or_else(|| eyre!("listen-type network requires listen-network"))?;
    VirtualNetwork::lookup(name, opts.connect.as_deref())
        .listen_ip()
        .map(Some)
}

fn print_table(prediction: &Prediction) {
    let join = |items: Vec<String>| {
        if items.is_empty() {
            "-".to_owned()
        } else {
            items.join("\n")
        }
    };
    let port = |p: Option<i64>| p.map_or_else(|| "-".to_owned(), |p| p.to_string());

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["FIELD", "PREDICTION"]);
    table.add_row(vec!["Listen address".to_owned(), prediction.listen_address.clone()]);
    table.add_row(vec![
        "Expected addresses".to_owned(),
        join(prediction.expected_ips.iter().map(|ip| ip.to_string()).collect()),
    ]);
    table.add_row(vec!["TLS channels".to_owned(), join(prediction.tls_channels.clone())]);
    table.add_row(vec![
        "Plaintext channels".to_owned(),
        join(prediction.plaintext_channels.clone()),
    ]);
    table.add_row(vec!["Port".to_owned(), port(prediction.port)]);
    table.add_row(vec!["TLS port".to_owned(), port(prediction.tls_port)]);
    table.add_row(vec![
        "Options".to_owned(),
        join(
            prediction
                .options
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
        ),
    ]);
    table.add_row(vec![
        "Failure patterns".to_owned(),
        join(prediction.fail_patterns.clone()),
    ]);
    println!("{table}");
    if prediction.expects_failure() {
        println!("\nStartup is expected to FAIL");
    } else {
        println!("\nStartup is expected to succeed");
    }
}

pub(crate) fn run(opts: PredictOpts) -> Result<()> {
    let scenario = Scenario::load(&opts.scenario)?;
    let env = scenario.env_state(QemuConf::load(&opts.qemu_conf)?);
    let host = HostAddresses::enumerate()?;

    let mut predictor = Predictor::new(&env, &host);
    if let Some(ip) = network_ip(&opts, &scenario)? {
        predictor = predictor.with_network_ip(ip);
    }
    let prediction = predictor
        .predict(&scenario.spice)
        .with_context(|| format!("Predicting {}", opts.scenario))?;

    if let Some(path) = &opts.output {
        prediction.save(path)?;
        info!("Wrote prediction to {path}");
    }
    if let Some(path) = &opts.domain_xml {
        let xml = DomainBuilder::new()
            .with_name(&opts.domain_name)
            .with_spice(&scenario.spice, &prediction.listen_address)
            .build_xml()?;
        std::fs::write(path, xml).with_context(|| format!("Failed to write {path}"))?;
        info!("Wrote domain XML to {path}");
    }

    match opts.format {
        OutputFormat::Table => print_table(&prediction),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&prediction).context("Failed to serialize prediction")?
        ),
    }
    Ok(())
}
