//! Host tool checks.
//!
//! Conversion shells out to `qemu-img` and registry pulls to `oras`; both
//! are looked up in PATH before a run so a missing tool fails up front
//! instead of once per image.

use anyhow::{bail, Result};

use crate::cache::transfer::OrasPuller;
use crate::convert::QemuImg;

/// Each tuple is (command, package providing it).
pub const QEMU_IMG: (&str, &str) = (QemuImg::BINARY, "qemu-utils");
pub const ORAS: (&str, &str) = (OrasPuller::BINARY, "oras");

pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {t} (install: {p})"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{msg}");
    }
    Ok(())
}

/// `qemu-img` is needed when conversion targets are configured, `oras` when
/// a registry source is enabled.
pub fn check_host_tools(needs_qemu: bool, needs_oras: bool) -> Result<()> {
    let mut tools = Vec::new();
    if needs_qemu {
        tools.push(QEMU_IMG);
    }
    if needs_oras {
        tools.push(ORAS);
    }
    check_required_tools(&tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn missing_tools_are_listed_with_packages() {
        let err = check_required_tools(&[("sh", "dash"), ("nonexistent_command_xyz", "fake-package")])
            .unwrap_err()
            .to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"), "{err}");
        assert!(!err.contains("dash"));
    }

    #[test]
    fn nothing_needed_passes() {
        assert!(check_host_tools(false, false).is_ok());
    }
}
