//! Finding and reading the QEMU process of a domain

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;

/// Where libvirt keeps the pid files of running QEMU domains
pub const LIBVIRT_QEMU_RUN_DIR: &str = "/run/libvirt/qemu";

/// Split a NUL separated `/proc/<pid>/cmdline`
pub fn parse_cmdline_bytes(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|&b| b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// Argument vector of process `pid`
pub fn process_args(pid: u32) -> Result<Vec<String>> {
    let path = format!("/proc/{pid}/cmdline");
    let bytes = std::fs::read(&path).with_context(|| format!("Failed to read {path}"))?;
    let args = parse_cmdline_bytes(&bytes);
    if args.is_empty() {
        return Err(eyre!("Process {pid} has an empty command line"));
    }
    debug!("Process {pid} runs {}", args[0]);
    Ok(args)
}

/// Command line of process `pid`, shell quoted
pub fn process_cmdline(pid: u32) -> Result<String> {
    let args = process_args(pid)?;
    shlex::try_join(args.iter().map(String::as_str))
        .map_err(|e| eyre!("Failed to quote command line of {pid}: {e}"))
}

/// Pid of the QEMU process running `domain`
pub fn domain_pid(run_dir: &Utf8Path, domain: &str) -> Result<u32> {
    let path = run_dir.join(format!("{domain}.pid"));
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {path}; is {domain} running?"))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("Invalid pid in {path}: {content:?}"))
}
