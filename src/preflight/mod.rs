//! Preflight checks run before a build touches the work directory.
//!
//! Missing host tools or a full disk otherwise surface as cryptic failures
//! deep inside a chroot step.

use std::path::Path;

use anyhow::{bail, Context, Result};

/// Host tools the build pipeline shells out to.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("chroot", "coreutils"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("tar", "tar"),
];

/// Check if a command exists on the host PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available, listing everything missing at
/// once.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let listing = missing
            .iter()
            .map(|(tool, package)| format!("  {tool} (install: {package})"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{listing}");
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

/// Fail unless at least `required_bytes` are free on the filesystem
/// containing `path`.
pub fn ensure_free_space(path: &Path, required_bytes: u64) -> Result<()> {
    let available = fs2::available_space(path)
        .with_context(|| format!("checking free space for '{}'", path.display()))?;

    if available < required_bytes {
        let gib = 1024.0 * 1024.0 * 1024.0;
        bail!(
            "insufficient disk space on '{}': {:.1} GiB available, {:.1} GiB required",
            path.display(),
            available as f64 / gib,
            required_bytes as f64 / gib
        );
    }
    Ok(())
}
