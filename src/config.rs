//! TOML build configuration for the command-line interface.
//!
//! ```toml
//! [build]
//! seed_archive = "/var/tmp/stage3-amd64.tar.xz"
//! work_dir = "/var/tmp/stage-builder/work"
//! checkpoint_strategy = "copy"
//! kernel = true
//!
//! [host]
//! distfiles_dir = "/var/cache/distfiles"
//! cooling_level = 7
//!
//! [repository]
//! host_dir = "/var/db/repos/gentoo"
//!
//! [target]
//! world = ["app-editors/vim"]
//! services = ["sshd"]
//!
//! [target.use]
//! "app-editors/vim" = ["minimal"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::repos::Repository;
use crate::settings::{ComputingPower, Settings, TargetSettings};
use crate::workdir::CheckpointStrategy;

pub const PROGRAM_NAME: &str = "stage-builder";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub build: BuildSection,
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub repository: RepositorySection,
    #[serde(default)]
    pub target: TargetSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    pub seed_archive: PathBuf,
    pub work_dir: Option<PathBuf>,
    /// "copy" (default) or "rename".
    pub checkpoint_strategy: Option<String>,
    /// Build a kernel via genkernel; skipping merges straight into the
    /// service-enabling step.
    #[serde(default)]
    pub kernel: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSection {
    pub log_dir: Option<PathBuf>,
    pub distfiles_dir: Option<PathBuf>,
    pub packages_dir: Option<PathBuf>,
    pub ccache_dir: Option<PathBuf>,
    pub cpu_core_count: Option<u32>,
    pub memory_size: Option<u64>,
    pub cooling_level: Option<u8>,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositorySection {
    /// Bind mount the main repository from this host checkout.
    pub host_dir: Option<PathBuf>,
    /// Unpack the main repository from a portage snapshot archive.
    pub snapshot_archive: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSection {
    pub profile: Option<String>,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub world: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default, rename = "use")]
    pub pkg_use: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub mask: Vec<String>,
    #[serde(default)]
    pub unmask: Vec<String>,
    #[serde(default)]
    pub accept_keywords: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub license: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub common_flags: Vec<String>,
    #[serde(default)]
    pub ccache: bool,
    #[serde(default)]
    pub degentoo: bool,
    #[serde(default)]
    pub custom_scripts: Vec<PathBuf>,
}

pub fn load_build_config(path: &Path) -> Result<BuildConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading build config '{}'", path.display()))?;
    let config: BuildConfig = toml::from_str(&text)
        .with_context(|| format!("parsing build config '{}'", path.display()))?;

    if config.repository.host_dir.is_some() && config.repository.snapshot_archive.is_some() {
        bail!(
            "invalid build config '{}': repository.host_dir and repository.snapshot_archive are mutually exclusive",
            path.display()
        );
    }
    Ok(config)
}

impl BuildConfig {
    pub fn settings(&self) -> Settings {
        let detected = ComputingPower::auto_detect();
        let power = ComputingPower {
            cpu_core_count: self.host.cpu_core_count.unwrap_or(detected.cpu_core_count),
            memory_size: self.host.memory_size.unwrap_or(detected.memory_size),
            cooling_level: self.host.cooling_level.unwrap_or(detected.cooling_level),
        };

        let mut settings = Settings::new(PROGRAM_NAME, power);
        settings.verbose = self.host.verbose;
        settings.log_dir = self.host.log_dir.clone();
        settings.host_distfiles_dir = self.host.distfiles_dir.clone();
        settings.host_packages_dir = self.host.packages_dir.clone();
        settings.host_ccache_dir = self.host.ccache_dir.clone();
        settings
    }

    pub fn target_settings(&self) -> TargetSettings {
        let mut target = TargetSettings::default();
        target.profile = self.target.profile.clone();
        target.install_list = self.target.install.clone();
        target.world_set = self.target.world.clone();
        target.service_list = self.target.services.clone();
        target.pkg_use = self.target.pkg_use.clone();
        target.pkg_mask = self.target.mask.clone();
        target.pkg_unmask = self.target.unmask.clone();
        target.pkg_accept_keywords = self.target.accept_keywords.clone();
        target.pkg_license = self.target.license.clone();
        target.build_opts.common_flags = self.target.common_flags.clone();
        target.ccache = self.target.ccache;
        target.degentoo = self.target.degentoo;
        target
    }

    pub fn repositories(&self) -> Vec<Repository> {
        if let Some(host_dir) = &self.repository.host_dir {
            vec![Repository::gentoo_from_host(host_dir)]
        } else if let Some(archive) = &self.repository.snapshot_archive {
            vec![Repository::gentoo_snapshot_archive(archive)]
        } else {
            vec![Repository::gentoo_rsync()]
        }
    }

    pub fn work_dir_path(&self) -> PathBuf {
        if let Some(dir) = &self.build.work_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(PROGRAM_NAME)
            .join("work")
    }

    pub fn checkpoint_strategy(&self) -> Result<CheckpointStrategy> {
        match self.build.checkpoint_strategy.as_deref() {
            None | Some("copy") => Ok(CheckpointStrategy::Copy),
            Some("rename") => Ok(CheckpointStrategy::Rename),
            Some(other) => bail!(
                "unsupported checkpoint_strategy '{other}' (expected 'copy' or 'rename')"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config() {
        let file = write_config(
            r#"
            [build]
            seed_archive = "/tmp/stage3.tar.xz"
            "#,
        );
        let config = load_build_config(file.path()).unwrap();

        assert_eq!(config.build.seed_archive, PathBuf::from("/tmp/stage3.tar.xz"));
        assert!(!config.build.kernel);
        assert_eq!(
            config.checkpoint_strategy().unwrap(),
            CheckpointStrategy::Copy
        );
        assert_eq!(config.repositories().len(), 1);
        assert!(config.repositories()[0].requires_emerge_sync());
    }

    #[test]
    fn test_full_target_section() {
        let file = write_config(
            r#"
            [build]
            seed_archive = "/tmp/stage3.tar.xz"
            checkpoint_strategy = "rename"
            kernel = true

            [host]
            cooling_level = 3

            [repository]
            host_dir = "/var/db/repos/gentoo"

            [target]
            world = ["app-editors/vim"]
            services = ["sshd"]
            ccache = false

            [target.use]
            "app-editors/vim" = ["minimal"]
            "#,
        );
        let config = load_build_config(file.path()).unwrap();

        let settings = config.settings();
        assert_eq!(settings.host_computing_power.cooling_level, 3);

        let target = config.target_settings();
        assert_eq!(target.world_set, vec!["app-editors/vim".to_string()]);
        assert_eq!(
            target.pkg_use.get("app-editors/vim"),
            Some(&vec!["minimal".to_string()])
        );
        assert_eq!(
            config.checkpoint_strategy().unwrap(),
            CheckpointStrategy::Rename
        );
        assert!(!config.repositories()[0].requires_emerge_sync());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let file = write_config(
            r#"
            [build]
            seed_archive = "/tmp/stage3.tar.xz"
            no_such_option = true
            "#,
        );
        assert!(load_build_config(file.path()).is_err());
    }

    #[test]
    fn test_conflicting_repository_sources_rejected() {
        let file = write_config(
            r#"
            [build]
            seed_archive = "/tmp/stage3.tar.xz"

            [repository]
            host_dir = "/var/db/repos/gentoo"
            snapshot_archive = "/tmp/portage.tar.xz"
            "#,
        );
        let err = load_build_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_bad_strategy_rejected() {
        let file = write_config(
            r#"
            [build]
            seed_archive = "/tmp/stage3.tar.xz"
            checkpoint_strategy = "snapshot"
            "#,
        );
        let config = load_build_config(file.path()).unwrap();
        assert!(config.checkpoint_strategy().is_err());
    }
}
