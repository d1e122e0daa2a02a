//! `spicecheck verify`

use camino::Utf8PathBuf;
use clap::{ArgGroup, Parser};
use color_eyre::eyre::{bail, Context};
use color_eyre::Result;

use spicecheck::address::{TcpProbe, DEFAULT_MAX_RETRY};
use spicecheck::host::HostAddresses;
use spicecheck::predict::Prediction;
use spicecheck::procinfo::{self, LIBVIRT_QEMU_RUN_DIR};
use spicecheck::verify::{verify, ObservedSpice};

/// Verify a running QEMU process against a prediction
#[derive(Debug, Parser)]
#[clap(group(ArgGroup::new("target").required(true).args(["pid", "domain"])))]
pub(crate) struct VerifyOpts {
    /// Prediction written by `spicecheck predict --output`
    #[clap(long)]
    pub(crate) prediction: Utf8PathBuf,

    /// Pid of the QEMU process
    #[clap(long)]
    pub(crate) pid: Option<u32>,

    /// Name of the running libvirt domain
    #[clap(long)]
    pub(crate) domain: Option<String>,

    /// Directory holding libvirt's QEMU pid files
    #[clap(long, default_value = LIBVIRT_QEMU_RUN_DIR)]
    pub(crate) run_dir: Utf8PathBuf,

    /// Connect attempts per address on transient errors
    #[clap(long, default_value_t = DEFAULT_MAX_RETRY)]
    pub(crate) max_retry: u32,
}

pub(crate) fn run(opts: VerifyOpts) -> Result<()> {
    let prediction = Prediction::load(&opts.prediction)?;
    if prediction.expects_failure() {
        bail!(
            "{} predicts a failed start; use check-failure instead",
            opts.prediction
        );
    }
    let pid = match (opts.pid, &opts.domain) {
        (Some(pid), _) => pid,
        (None, Some(domain)) => procinfo::domain_pid(&opts.run_dir, domain)?,
        (None, None) => bail!("Either --pid or --domain is required"),
    };
    let args = procinfo::process_args(pid)?;
    let observed = ObservedSpice::from_args(&args)
        .with_context(|| format!("Parsing command line of process {pid}"))?;
    let host = HostAddresses::enumerate()?;
    let probe = TcpProbe {
        max_retry: opts.max_retry,
    };
    verify(&prediction, &observed, &host, &probe)?;
    println!("Process {pid} matches {}", opts.prediction);
    Ok(())
}
