//! Preflight checks for run validation.
//!
//! Validates that the host system has the emulator installed before a run.
//! This prevents cryptic errors after the image has already been built.

use anyhow::{bail, Result};
use which::which;

/// Host tools a guest run depends on, as (command, providing package) pairs.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("qemu-system-aarch64", "qemu-system-arm")];

/// Check if a command exists on the host system's PATH.
pub fn command_exists(cmd: &str) -> bool {
    which(cmd).is_ok()
}

/// Verify every listed tool resolves on PATH; the error names each missing
/// command together with the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<&(&str, &str)> = tools.iter().filter(|(t, _)| !command_exists(t)).collect();
    if missing.is_empty() {
        return Ok(());
    }
    let mut msg = String::from("missing required host tools:");
    for (tool, package) in missing {
        msg.push_str(&format!("\n  {} (install: {})", tool, package));
    }
    bail!("{}", msg);
}

/// Check that all tools in [`REQUIRED_TOOLS`] are available.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
