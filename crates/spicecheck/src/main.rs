//! Command line interface of spicecheck

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod cli;

/// Predict and verify the sockets and options of a libvirt SPICE display.
///
/// Predict what a graphics configuration should produce before starting the
/// domain, then verify the running QEMU process against the prediction.
#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the addresses configured on this host
    #[clap(name = "host-addrs")]
    HostAddrs(cli::host_addrs::HostAddrsOpts),

    /// Predict the outcome of a scenario
    Predict(cli::predict::PredictOpts),

    /// Verify a running domain against a prediction
    Verify(cli::verify::VerifyOpts),

    /// Check the error output of a failed start against a prediction
    #[clap(name = "check-failure")]
    CheckFailure(cli::check_failure::CheckFailureOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr, filtered by RUST_LOG and defaulting to 'info'.
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
        .init();
    Ok(())
}

fn main() -> Result<(), Report> {
    install_tracing()?;
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::HostAddrs(opts) => cli::host_addrs::run(opts)?,
        Commands::Predict(opts) => cli::predict::run(opts)?,
        Commands::Verify(opts) => cli::verify::run(opts)?,
        Commands::CheckFailure(opts) => cli::check_failure::run(opts)?,
    }
    tracing::debug!("exiting");
    Ok(())
}
