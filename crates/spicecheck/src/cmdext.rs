//! Running external tools

use std::process::{Command, Output};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;

/// Run a [`Command`] and turn a non-zero exit into an error carrying stderr
pub trait CommandRunExt {
    /// Run to completion
    fn run(&mut self) -> Result<()>;
    /// Run to completion and return stdout
    fn run_get_string(&mut self) -> Result<String>;
}

fn output_checked(cmd: &mut Command) -> Result<Output> {
    debug!("Running {cmd:?}");
    let out = cmd
        .output()
        .with_context(|| format!("Failed to spawn {cmd:?}"))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(eyre!("{cmd:?} failed ({}): {}", out.status, stderr.trim()));
    }
    Ok(out)
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        output_checked(self).map(drop)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let out = output_checked(self)?;
        String::from_utf8(out.stdout).with_context(|| format!("{self:?} printed invalid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_run_get_string() {
        let out = Command::new("echo").arg("spice").run_get_string().unwrap();
        assert_eq!(out, "spice\n");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let err = Command::new("sh")
            .args(["-c", "echo no such network >&2; exit 1"])
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("no such network"));
    }
}
