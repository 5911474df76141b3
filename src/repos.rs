//! Package repository descriptors and their repos.conf provisioning.
//!
//! A repository is provisioned into the chroot by writing its
//! `etc/portage/repos.conf/<name>.conf` entry and creating its data
//! directory. How the data gets there depends on the variant: manual syncs
//! unpack a snapshot archive host-side, bind-mount repositories expose a
//! host directory for the duration of each chroot session (recorded as a
//! `host-dir =` line, which is also how sessions discover them), and
//! emerge-sync repositories let the package manager sync itself from inside
//! the chroot.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::paths::{host_path, TargetPaths};
use crate::seed::unpack_tarball;

/// How a repository's data directory gets populated.
#[derive(Debug, Clone)]
pub enum RepositorySource {
    /// A snapshot archive unpacked host-side into the data directory.
    ManualSync { archive: PathBuf },
    /// A host directory bind mounted read-only over the data directory.
    BindMount { host_dir: PathBuf },
    /// Synced by emerge from inside the chroot; carries its complete
    /// repos.conf entry.
    EmergeSync { repos_conf: String },
}

#[derive(Debug, Clone)]
pub struct Repository {
    name: String,
    /// Absolute data directory path inside the chroot.
    datadir: String,
    source: RepositorySource,
}

const GENTOO_DATADIR: &str = "/var/db/repos/gentoo";
const GENTOO_RSYNC_URI: &str = "rsync://rsync.gentoo.org/gentoo-portage";

impl Repository {
    pub fn new(name: &str, datadir: &str, source: RepositorySource) -> Self {
        debug_assert!(datadir.starts_with('/'));
        Self {
            name: name.to_string(),
            datadir: datadir.to_string(),
            source,
        }
    }

    /// The main gentoo repository, synced by emerge over rsync with
    /// metamanifest verification (per the Gentoo handbook).
    pub fn gentoo_rsync() -> Self {
        let repos_conf = format!(
            "[gentoo]\n\
             location = {GENTOO_DATADIR}\n\
             sync-type = rsync\n\
             sync-uri = {GENTOO_RSYNC_URI}\n\
             auto-sync = yes\n\
             sync-rsync-verify-jobs = 1\n\
             sync-rsync-verify-metamanifest = yes\n\
             sync-rsync-verify-max-age = 24\n\
             sync-openpgp-key-path = /usr/share/openpgp-keys/gentoo-release.asc\n\
             sync-openpgp-key-refresh-retry-count = 40\n\
             sync-openpgp-key-refresh-retry-overall-timeout = 1200\n\
             sync-openpgp-key-refresh-retry-delay-exp-base = 2\n\
             sync-openpgp-key-refresh-retry-delay-max = 60\n\
             sync-openpgp-key-refresh-retry-delay-mult = 4\n"
        );
        Self::new(
            "gentoo",
            GENTOO_DATADIR,
            RepositorySource::EmergeSync { repos_conf },
        )
    }

    /// The main gentoo repository bind mounted from a host checkout.
    pub fn gentoo_from_host(host_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            "gentoo",
            GENTOO_DATADIR,
            RepositorySource::BindMount {
                host_dir: host_dir.into(),
            },
        )
    }

    /// The main gentoo repository from a portage snapshot archive.
    pub fn gentoo_snapshot_archive(archive: impl Into<PathBuf>) -> Self {
        Self::new(
            "gentoo",
            GENTOO_DATADIR,
            RepositorySource::ManualSync {
                archive: archive.into(),
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datadir_path(&self) -> &str {
        &self.datadir
    }

    pub fn source(&self) -> &RepositorySource {
        &self.source
    }

    pub fn requires_emerge_sync(&self) -> bool {
        matches!(self.source, RepositorySource::EmergeSync { .. })
    }

    /// `<name>.conf` for the main repository, `overlay-<name>.conf` for
    /// everything else.
    fn conf_file_name(&self) -> String {
        if self.name == "gentoo" {
            format!("{}.conf", self.name)
        } else {
            format!("overlay-{}.conf", self.name)
        }
    }

    fn conf_content(&self) -> String {
        match &self.source {
            RepositorySource::ManualSync { .. } => format!(
                "[{}]\nauto-sync = no\nlocation = {}\n",
                self.name, self.datadir
            ),
            RepositorySource::BindMount { host_dir } => format!(
                "[{}]\nauto-sync = no\nlocation = {}\nhost-dir = {}\n",
                self.name,
                self.datadir,
                host_dir.display()
            ),
            RepositorySource::EmergeSync { repos_conf } => repos_conf.clone(),
        }
    }

    /// Write the repos.conf entry and create the data directory.
    pub fn provision(&self, chroot_dir: &Path) -> Result<()> {
        let conf_dir = host_path(chroot_dir, TargetPaths::REPOS_CONF_DIR);
        fs::create_dir_all(&conf_dir)
            .with_context(|| format!("creating '{}'", conf_dir.display()))?;

        let conf_file = conf_dir.join(self.conf_file_name());
        fs::write(&conf_file, self.conf_content())
            .with_context(|| format!("writing '{}'", conf_file.display()))?;

        let datadir = host_path(chroot_dir, &self.datadir);
        fs::create_dir_all(&datadir)
            .with_context(|| format!("creating '{}'", datadir.display()))?;
        Ok(())
    }

    /// Host-side sync; only meaningful for manual-sync repositories.
    pub fn sync(&self, chroot_dir: &Path) -> Result<()> {
        if let RepositorySource::ManualSync { archive } = &self.source {
            let datadir = host_path(chroot_dir, &self.datadir);
            println!(
                "[repos] unpacking snapshot '{}' for repository '{}'",
                archive.display(),
                self.name
            );
            unpack_tarball(archive, &datadir).with_context(|| {
                format!("syncing repository '{}' from snapshot", self.name)
            })?;
        }
        Ok(())
    }
}

/// A bind-mount repository as recorded in the chroot's repos.conf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoBind {
    pub name: String,
    /// Absolute data directory path inside the chroot.
    pub datadir: String,
    pub host_dir: PathBuf,
}

/// Scan the chroot's repos.conf directory for repositories that need a host
/// bind mount. The conf files are the source of truth so a resumed build
/// sees the same bindings the original process set up.
pub fn scan_repos_conf(chroot_dir: &Path) -> Result<Vec<RepoBind>> {
    let conf_dir = host_path(chroot_dir, TargetPaths::REPOS_CONF_DIR);
    let mut binds = Vec::new();
    if !conf_dir.is_dir() {
        return Ok(binds);
    }

    let mut entries: Vec<_> = fs::read_dir(&conf_dir)
        .with_context(|| format!("reading '{}'", conf_dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading '{}'", path.display()))?;

        let mut name = None;
        let mut location = None;
        let mut host_dir = None;
        for line in content.lines() {
            let line = line.trim();
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                name = Some(section.to_string());
            } else if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "location" => location = Some(value.trim().to_string()),
                    "host-dir" => host_dir = Some(PathBuf::from(value.trim())),
                    _ => {}
                }
            }
        }

        if let (Some(name), Some(datadir), Some(host_dir)) = (name, location, host_dir) {
            binds.push(RepoBind {
                name,
                datadir,
                host_dir,
            });
        }
    }

    Ok(binds)
}

/// Remove the `host-dir` lines from every repos.conf entry. Run during
/// cleanup: the finished stage must not reference build-host paths.
pub fn strip_host_dirs(chroot_dir: &Path) -> Result<()> {
    let conf_dir = host_path(chroot_dir, TargetPaths::REPOS_CONF_DIR);
    if !conf_dir.is_dir() {
        return Ok(());
    }

    for entry in
        fs::read_dir(&conf_dir).with_context(|| format!("reading '{}'", conf_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if !content.contains("host-dir") {
            continue;
        }
        let stripped: String = content
            .lines()
            .filter(|line| !line.trim_start().starts_with("host-dir"))
            .map(|line| format!("{line}\n"))
            .collect();
        fs::write(&path, stripped)
            .with_context(|| format!("rewriting '{}'", path.display()))?;
    }
    Ok(())
}
