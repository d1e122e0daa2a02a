//! `spicecheck host-addrs`

use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};

use spicecheck::host::HostAddresses;

use super::OutputFormat;

/// List host addresses as prediction sees them
#[derive(Debug, Parser)]
pub(crate) struct HostAddrsOpts {
    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub(crate) format: OutputFormat,
}

pub(crate) fn run(opts: HostAddrsOpts) -> Result<()> {
    let host = HostAddresses::enumerate()?;
    match opts.format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["FAMILY", "ADDRESS", "INTERFACE", "SCOPE"]);
            for addr in host.all() {
                table.add_row(vec![
                    addr.family().to_string(),
                    addr.addr(),
                    addr.iface().unwrap_or("-").to_owned(),
                    addr.scope().to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&host)
                    .context("Failed to serialize host addresses")?
            );
        }
    }
    Ok(())
}
