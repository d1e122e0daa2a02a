//! `spicecheck check-failure`

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;

use spicecheck::predict::Prediction;
use spicecheck::verify::check_startup;

/// Check the error output of a failed domain start
#[derive(Debug, Parser)]
pub(crate) struct CheckFailureOpts {
    /// Prediction written by `spicecheck predict --output`
    #[clap(long)]
    pub(crate) prediction: Utf8PathBuf,

    /// File holding the error output of the start attempt
    #[clap(long)]
    pub(crate) log: Utf8PathBuf,
}

pub(crate) fn run(opts: CheckFailureOpts) -> Result<()> {
    let prediction = Prediction::load(&opts.prediction)?;
    let output = std::fs::read_to_string(&opts.log)
        .with_context(|| format!("Failed to read {}", opts.log))?;
    check_startup(&prediction, false, &output)?;
    println!("Failure matches {}", opts.prediction);
    Ok(())
}
