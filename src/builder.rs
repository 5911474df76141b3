//! The build driver: wires seed stages, repositories, the portage
//! configuration, kernel installers and cleanup into pipeline actions.
//!
//! Each action runs under `BuildPipeline::run_action`, so a crash or error
//! anywhere leaves the work directory resumable from the last sealed
//! checkpoint.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::chroot::{ChrootSession, HostBind, ScriptInChroot};
use crate::kernel::KernelInstaller;
use crate::paths::{host_path, TargetPaths};
use crate::pipeline::{BuildPipeline, BuildStep};
use crate::repos::{scan_repos_conf, strip_host_dirs, Repository};
use crate::seed::SeedStage;
use crate::settings::{IdMap, Settings, TargetSettings};
use crate::workdir::WorkDir;

pub const SETTINGS_RECORD: &str = "settings.json";
pub const TARGET_RECORD: &str = "target.json";
pub const ID_MAP_RECORD: &str = "id_map.json";

/// Packages that must be emerged before anything else they could cache or
/// accelerate.
const INSTALL_FIRST: &[&str] = &["dev-util/ccache"];

pub struct Builder {
    settings: Settings,
    target: TargetSettings,
    id_map: IdMap,
    work_dir: WorkDir,
    pipeline: BuildPipeline,
}

impl Builder {
    /// Start a build in an initialized work directory, persisting all
    /// parameters so a later process can resume.
    pub fn new(
        settings: Settings,
        target: TargetSettings,
        id_map: IdMap,
        work_dir: WorkDir,
    ) -> Result<Self> {
        settings.validate()?;
        target.validate()?;
        id_map.verify_root_mapping()?;
        work_dir.verify()?;
        if target.ccache && settings.host_ccache_dir.is_none() {
            bail!("ccache is enabled but no host ccache directory is configured");
        }

        work_dir.save_record(SETTINGS_RECORD, &settings)?;
        work_dir.save_record(TARGET_RECORD, &target)?;
        work_dir.save_record(ID_MAP_RECORD, &id_map)?;
        let pipeline = BuildPipeline::create(work_dir.clone())?;

        Ok(Self {
            settings,
            target,
            id_map,
            work_dir,
            pipeline,
        })
    }

    /// Pick up an interrupted build from its persisted records.
    pub fn resume(work_dir: WorkDir) -> Result<Self> {
        work_dir.verify()?;
        let settings: Settings = work_dir
            .load_record(SETTINGS_RECORD)
            .context("loading persisted host settings")?;
        let target: TargetSettings = work_dir
            .load_record(TARGET_RECORD)
            .context("loading persisted target settings")?;
        let id_map: IdMap = work_dir
            .load_record(ID_MAP_RECORD)
            .context("loading persisted chroot id mapping")?;

        settings.validate()?;
        target.validate()?;
        id_map.verify_root_mapping()?;
        let pipeline = BuildPipeline::resume(work_dir.clone())?;

        Ok(Self {
            settings,
            target,
            id_map,
            work_dir,
            pipeline,
        })
    }

    pub fn progress(&self) -> BuildStep {
        self.pipeline.progress()
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn target_settings(&self) -> &TargetSettings {
        &self.target
    }

    pub fn id_map(&self) -> &IdMap {
        &self.id_map
    }

    /// INIT → UNPACKED: unpack the seed stage and create the cache
    /// directories later sessions bind over.
    pub fn unpack(&mut self, seed: &dyn SeedStage) -> Result<()> {
        let target = &self.target;
        let digest = seed.digest().unwrap_or_else(|_| "unknown".into());
        println!("[unpack] seed digest: {digest}");

        self.pipeline
            .run_action(&[BuildStep::Init], BuildStep::Unpacked, |chroot_dir| {
                seed.unpack(chroot_dir)?;

                for dir in [
                    TargetPaths::LOG_DIR,
                    TargetPaths::DISTFILES_DIR,
                    TargetPaths::BINPKG_DIR,
                ] {
                    let path = host_path(chroot_dir, dir);
                    fs::create_dir_all(&path)
                        .with_context(|| format!("creating '{}'", path.display()))?;
                }
                if target.ccache {
                    let path = host_path(chroot_dir, TargetPaths::CCACHE_DIR);
                    fs::create_dir_all(&path)
                        .with_context(|| format!("creating '{}'", path.display()))?;
                }
                Ok(())
            })
    }

    /// UNPACKED → REPOSITORIES_READY: provision repos.conf entries, run
    /// host-side syncs, then let emerge sync the rest from inside the
    /// chroot.
    pub fn init_repositories(&mut self, repositories: &[Repository]) -> Result<()> {
        let settings = &self.settings;
        let target = &self.target;

        self.pipeline.run_action(
            &[BuildStep::Unpacked],
            BuildStep::RepositoriesReady,
            |chroot_dir| {
                for repo in repositories {
                    println!("[repos] provisioning '{}'", repo.name());
                    repo.provision(chroot_dir)?;
                }
                for repo in repositories {
                    repo.sync(chroot_dir)?;
                }

                if repositories.iter().any(Repository::requires_emerge_sync) {
                    let mut session = open_session(settings, target, chroot_dir)?;
                    session.bind()?;
                    session.run_streamed(&[], "emerge --sync")?;
                    session.unbind();
                }
                Ok(())
            },
        )
    }

    /// REPOSITORIES_READY → CONF_READY: write the portage configuration.
    pub fn init_confdir(&mut self) -> Result<()> {
        let settings = &self.settings;
        let target = &self.target;

        self.pipeline.run_action(
            &[BuildStep::RepositoriesReady],
            BuildStep::ConfReady,
            |chroot_dir| {
                crate::confdir::TargetConfDir::new(settings, target, chroot_dir).write_all()
            },
        )
    }

    /// CONF_READY → WORLD_UPDATED: install the requested packages and bring
    /// @world up to date.
    pub fn update_world(&mut self, preprocess_scripts: &[&dyn ScriptInChroot]) -> Result<()> {
        let settings = &self.settings;
        let target = &self.target;

        self.pipeline.run_action(
            &[BuildStep::ConfReady],
            BuildStep::WorldUpdated,
            |chroot_dir| {
                write_world_file(chroot_dir, &target.world_set)?;
                let install_list = compute_install_list(target, chroot_dir);

                let mut session = open_session(settings, target, chroot_dir)?;
                session.bind()?;
                for script in preprocess_scripts {
                    session.run_script(*script)?;
                }
                for pkg in &install_list {
                    session.run_streamed(&[], &format!("emerge --oneshot {pkg}"))?;
                }
                session.run_streamed(&[], "emerge --update --deep --newuse @world")?;

                // A seed whose perl modules already need reinstalling is too
                // old to produce a consistent stage.
                if session
                    .run(&[], "command -v perl-cleaner >/dev/null")
                    .is_ok()
                {
                    let out = session.run(&[], "perl-cleaner --pretend --all")?;
                    if !out.contains("No package needs to be reinstalled") {
                        bail!("perl modules need reinstalling; use a newer seed stage");
                    }
                }
                session.unbind();
                Ok(())
            },
        )
    }

    /// WORLD_UPDATED → KERNEL_INSTALLED: optional kernel branch.
    pub fn install_kernel(&mut self, installer: &dyn KernelInstaller) -> Result<()> {
        let settings = &self.settings;
        let work_dir = &self.work_dir;

        self.pipeline.run_action(
            &[BuildStep::WorldUpdated],
            BuildStep::KernelInstalled,
            |_chroot_dir| {
                installer.install(settings, &settings.host_computing_power, work_dir)
            },
        )
    }

    /// {WORLD_UPDATED, KERNEL_INSTALLED} → SERVICES_ENABLED: the merge
    /// point of the optional kernel branch.
    pub fn enable_services(&mut self) -> Result<()> {
        let settings = &self.settings;
        let target = &self.target;

        self.pipeline.run_action(
            &[BuildStep::WorldUpdated, BuildStep::KernelInstalled],
            BuildStep::ServicesEnabled,
            |chroot_dir| {
                if target.service_list.is_empty() {
                    return Ok(());
                }
                let mut session = open_session(settings, target, chroot_dir)?;
                session.bind()?;
                for service in &target.service_list {
                    session.run_streamed(&[], &format!("systemctl enable {service}"))?;
                }
                session.unbind();
                Ok(())
            },
        )
    }

    /// SERVICES_ENABLED → CUSTOMIZED: user-supplied scripts.
    pub fn customize_system(&mut self, scripts: &[&dyn ScriptInChroot]) -> Result<()> {
        let settings = &self.settings;
        let target = &self.target;

        self.pipeline.run_action(
            &[BuildStep::ServicesEnabled],
            BuildStep::Customized,
            |chroot_dir| {
                if scripts.is_empty() {
                    return Ok(());
                }
                let mut session = open_session(settings, target, chroot_dir)?;
                session.bind()?;
                for script in scripts {
                    session.run_script(*script)?;
                }
                session.unbind();
                Ok(())
            },
        )
    }

    /// CUSTOMIZED → CLEANED_UP: depclean and remove build-host references;
    /// with `degentoo`, strip portage itself out of the stage.
    pub fn cleanup(&mut self) -> Result<()> {
        let settings = &self.settings;
        let target = &self.target;

        self.pipeline.run_action(
            &[BuildStep::Customized],
            BuildStep::CleanedUp,
            |chroot_dir| {
                let mut session = open_session(settings, target, chroot_dir)?;
                session.bind()?;
                if !target.degentoo {
                    session.run(&[], "eselect news read all")?;
                    session.run_streamed(&[], "emerge --depclean")?;
                    session.unbind();
                    strip_host_dirs(chroot_dir)?;
                } else {
                    session.run_streamed(&[], "emerge --depclean")?;
                    session.run_streamed(
                        &[("CLEAN_DELAY", "0")],
                        "emerge --unmerge sys-devel/gcc",
                    )?;
                    session.run_streamed(
                        &[("CLEAN_DELAY", "0")],
                        "emerge --unmerge sys-apps/portage",
                    )?;
                    session.unbind();
                    for dir in [
                        TargetPaths::CONF_DIR,
                        TargetPaths::STATE_DIR,
                        TargetPaths::PKG_DB_DIR,
                        TargetPaths::SRC_DIR,
                        TargetPaths::LOG_DIR,
                        TargetPaths::DISTFILES_DIR,
                        TargetPaths::BINPKG_DIR,
                    ] {
                        let path = host_path(chroot_dir, dir);
                        if path.exists() {
                            fs::remove_dir_all(&path)
                                .with_context(|| format!("removing '{}'", path.display()))?;
                        }
                    }
                }
                Ok(())
            },
        )
    }
}

/// Assemble a chroot session with the binds this build needs: host caches
/// from the settings plus every bind-mount repository recorded in the
/// chroot's repos.conf.
fn open_session(
    settings: &Settings,
    target: &TargetSettings,
    chroot_dir: &Path,
) -> Result<ChrootSession> {
    let mut session = ChrootSession::new(chroot_dir);

    if let Some(log_dir) = &settings.log_dir {
        session.add_bind(HostBind {
            host_dir: log_dir.clone(),
            target: TargetPaths::LOG_DIR.to_string(),
            read_only: false,
        });
    }
    if let Some(distfiles) = &settings.host_distfiles_dir {
        session.add_bind(HostBind {
            host_dir: distfiles.clone(),
            target: TargetPaths::DISTFILES_DIR.to_string(),
            read_only: false,
        });
    }
    if let Some(packages) = &settings.host_packages_dir {
        session.add_bind(HostBind {
            host_dir: packages.clone(),
            target: TargetPaths::BINPKG_DIR.to_string(),
            read_only: false,
        });
    }
    if target.ccache {
        if let Some(ccache) = &settings.host_ccache_dir {
            session.add_bind(HostBind {
                host_dir: ccache.clone(),
                target: TargetPaths::CCACHE_DIR.to_string(),
                read_only: false,
            });
        }
    }
    for repo_bind in scan_repos_conf(chroot_dir)? {
        session.add_bind(HostBind {
            host_dir: repo_bind.host_dir,
            target: repo_bind.datadir,
            read_only: true,
        });
    }

    Ok(session)
}

/// Write the world file from the target's world set.
fn write_world_file(chroot_dir: &Path, world_set: &[String]) -> Result<()> {
    let path = host_path(chroot_dir, TargetPaths::WORLD_FILE);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let mut buf = String::new();
    for pkg in world_set {
        buf.push_str(pkg);
        buf.push('\n');
    }
    fs::write(&path, buf).with_context(|| format!("writing world file '{}'", path.display()))
}

/// Packages still missing from the chroot, install-first entries ordered to
/// the front.
fn compute_install_list(target: &TargetSettings, chroot_dir: &Path) -> Vec<String> {
    let mut list: Vec<String> = target
        .install_list
        .iter()
        .chain(target.world_set.iter())
        .filter(|pkg| !pkg_installed(chroot_dir, pkg))
        .cloned()
        .collect();

    for pinned in INSTALL_FIRST.iter().rev() {
        if let Some(pos) = list.iter().position(|pkg| pkg == pinned) {
            let pkg = list.remove(pos);
            list.insert(0, pkg);
        }
    }
    list
}

/// Whether a `category/name` package has an entry in the chroot's package
/// database.
fn pkg_installed(chroot_dir: &Path, pkg: &str) -> bool {
    let Some((category, name)) = pkg.split_once('/') else {
        return false;
    };
    let category_dir = host_path(chroot_dir, TargetPaths::PKG_DB_DIR).join(category);
    let Ok(entries) = fs::read_dir(category_dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(entry_name) = file_name.to_str() else {
            continue;
        };
        // "vim-9.1.0" matches "vim" but not "vim-core".
        if let Some(rest) = entry_name.strip_prefix(name) {
            if rest
                .strip_prefix('-')
                .is_some_and(|v| v.starts_with(|c: char| c.is_ascii_digit()))
            {
                return true;
            }
        }
    }
    false
}
