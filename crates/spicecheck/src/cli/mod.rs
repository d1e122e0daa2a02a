//! Subcommands of the `spicecheck` binary

use clap::ValueEnum;

pub(crate) mod check_failure;
pub(crate) mod host_addrs;
pub(crate) mod predict;
pub(crate) mod verify;

/// How results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub(crate) enum OutputFormat {
    /// Human readable table
    Table,
    /// JSON document
    Json,
}
