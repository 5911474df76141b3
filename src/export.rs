//! Exporters: turn the final sealed checkpoint into distributable
//! artifacts.
//!
//! Exporters read the checkpoint tree but never mutate it; sealed
//! checkpoints stay intact so the export can be re-run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::process::{self, Cmd};
use crate::seed::sha512_file;
use crate::settings::Settings;
use crate::workdir::WorkDir;

pub trait Exporter {
    /// Validate host prerequisites before touching anything.
    fn check(&self) -> Result<()>;

    fn export(&self, settings: &Settings, work_dir: &WorkDir) -> Result<()>;
}

/// Export the stage as a squashfs image plus the kernel and initramfs
/// pulled out of its /boot, with a sha512 sidecar for the image.
pub struct SquashfsExporter {
    pub rootfs_file: PathBuf,
    pub checksum_file: PathBuf,
    pub kernel_file: PathBuf,
    pub initramfs_file: PathBuf,
}

impl SquashfsExporter {
    /// Conventional file names inside an output directory.
    pub fn into_dir(output_dir: &Path) -> Self {
        Self {
            rootfs_file: output_dir.join("rootfs.sqfs"),
            checksum_file: output_dir.join("rootfs.sqfs.sha512"),
            kernel_file: output_dir.join("vmlinuz"),
            initramfs_file: output_dir.join("initramfs.img"),
        }
    }
}

impl Exporter for SquashfsExporter {
    fn check(&self) -> Result<()> {
        if !process::exists("mksquashfs") {
            bail!(
                "mksquashfs not found. Install squashfs-tools:\n\
                 On Gentoo: emerge sys-fs/squashfs-tools\n\
                 On Fedora: sudo dnf install squashfs-tools\n\
                 On Ubuntu: sudo apt install squashfs-tools"
            );
        }
        Ok(())
    }

    fn export(&self, _settings: &Settings, work_dir: &WorkDir) -> Result<()> {
        self.check()?;

        let Some(checkpoint) = work_dir.latest_checkpoint()? else {
            bail!("work directory has no sealed checkpoint to export");
        };
        let rootfs_dir = work_dir.checkpoint_path(&checkpoint);
        println!("[export] exporting checkpoint '{checkpoint}'");

        for out in [
            &self.rootfs_file,
            &self.checksum_file,
            &self.kernel_file,
            &self.initramfs_file,
        ] {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating '{}'", parent.display()))?;
            }
        }

        // Kernel and initramfs are copied out, and /boot is excluded from
        // the image instead of being deleted from the checkpoint.
        let kernel = find_boot_artifact(&rootfs_dir, "vmlinuz")?;
        let initramfs = find_boot_artifact(&rootfs_dir, "initramfs")?;
        fs::copy(&kernel, &self.kernel_file)
            .with_context(|| format!("copying kernel '{}'", kernel.display()))?;
        fs::copy(&initramfs, &self.initramfs_file)
            .with_context(|| format!("copying initramfs '{}'", initramfs.display()))?;

        if self.rootfs_file.exists() {
            fs::remove_file(&self.rootfs_file).with_context(|| {
                format!("removing stale image '{}'", self.rootfs_file.display())
            })?;
        }
        Cmd::new("mksquashfs")
            .arg_path(&rootfs_dir)
            .arg_path(&self.rootfs_file)
            .args(&["-no-progress", "-noappend", "-quiet", "-e", "boot"])
            .error_msg("mksquashfs failed. Install squashfs-tools.")
            .run_interactive()?;

        let digest = sha512_file(&self.rootfs_file)?;
        let image_name = self
            .rootfs_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        fs::write(&self.checksum_file, format!("{digest}  {image_name}\n"))
            .with_context(|| format!("writing '{}'", self.checksum_file.display()))?;

        println!("[export] image at {}", self.rootfs_file.display());
        Ok(())
    }
}

/// Locate a boot artifact (`vmlinuz*`, `initramfs*`) in the checkpoint's
/// /boot directory.
fn find_boot_artifact(rootfs_dir: &Path, prefix: &str) -> Result<PathBuf> {
    let boot = rootfs_dir.join("boot");
    let mut candidates = Vec::new();
    let entries = fs::read_dir(&boot)
        .with_context(|| format!("reading '{}' (was the kernel step run?)", boot.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    candidates.pop().ok_or_else(|| {
        anyhow::anyhow!(
            "no {prefix}* found under '{}'; run the kernel-install step first",
            boot.display()
        )
    })
}
