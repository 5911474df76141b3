//! Host and target settings persisted alongside the work directory.
//!
//! `Settings` describes the machine performing the build, `TargetSettings`
//! the stage being produced. Both are serialized into the work directory so
//! an interrupted build can be resumed by a fresh process with the exact
//! parameters it started with.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Host-side build settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub program_name: String,

    /// Host directory receiving portage build logs, bind mounted over
    /// /var/log/portage for each chroot session.
    pub log_dir: Option<PathBuf>,

    pub verbose: bool,

    pub host_computing_power: ComputingPower,

    /// Host distfiles cache, bind mounted over /var/cache/distfiles.
    pub host_distfiles_dir: Option<PathBuf>,

    /// Host binary-package cache, bind mounted over /var/cache/binpkgs.
    pub host_packages_dir: Option<PathBuf>,

    /// Host ccache directory, bind mounted over /var/tmp/ccache.
    pub host_ccache_dir: Option<PathBuf>,
}

impl Settings {
    pub fn new(program_name: &str, power: ComputingPower) -> Self {
        Self {
            program_name: program_name.to_string(),
            log_dir: None,
            verbose: false,
            host_computing_power: power,
            host_distfiles_dir: None,
            host_packages_dir: None,
            host_ccache_dir: None,
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.program_name.is_empty() {
            return Err(SettingsError("program_name must not be empty".into()));
        }
        self.host_computing_power.validate()?;
        for (label, dir) in [
            ("log_dir", &self.log_dir),
            ("host_distfiles_dir", &self.host_distfiles_dir),
            ("host_packages_dir", &self.host_packages_dir),
            ("host_ccache_dir", &self.host_ccache_dir),
        ] {
            if let Some(dir) = dir {
                if !dir.is_dir() {
                    return Err(SettingsError(format!(
                        "{} \"{}\" is not a directory",
                        label,
                        dir.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Compiler/linker flag sets written into make.conf.
///
/// An empty list means "inherit COMMON_FLAGS" for the flags that support it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOpts {
    pub common_flags: Vec<String>,
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub fcflags: Vec<String>,
    pub fflags: Vec<String>,
    pub ldflags: Vec<String>,
    pub asflags: Vec<String>,
}

/// Description of the stage being built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    pub profile: Option<String>,

    /// Packages emerged one-shot, without entering the world file.
    pub install_list: Vec<String>,

    /// Packages recorded in the world file and kept up to date.
    pub world_set: Vec<String>,

    pub pkg_use: BTreeMap<String, Vec<String>>,
    pub pkg_mask: Vec<String>,
    pub pkg_unmask: Vec<String>,
    pub pkg_accept_keywords: BTreeMap<String, Vec<String>>,
    pub pkg_license: BTreeMap<String, Vec<String>>,

    pub build_opts: BuildOpts,
    pub kern_build_opts: BuildOpts,

    /// ccache is a global toggle; it needs the host ccache directory bound
    /// into every session and cannot be enabled per package.
    pub ccache: bool,

    /// Services enabled in the target's default runlevel.
    pub service_list: Vec<String>,

    /// Strip portage itself out of the finished stage.
    pub degentoo: bool,
}

impl TargetSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        for pkg in &self.world_set {
            if self.install_list.contains(pkg) {
                return Err(SettingsError(format!(
                    "package \"{pkg}\" appears in both install_list and world_set"
                )));
            }
        }
        Ok(())
    }
}

/// What the build host can sustain, used to derive emerge/make parallelism.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComputingPower {
    pub cpu_core_count: u32,
    /// In bytes.
    pub memory_size: u64,
    /// 1-10, less is weaker cooling.
    pub cooling_level: u8,
}

const GIB: u64 = 1024 * 1024 * 1024;

impl ComputingPower {
    pub fn new(cpu_core_count: u32, memory_size: u64, cooling_level: u8) -> Result<Self, SettingsError> {
        let power = Self {
            cpu_core_count,
            memory_size,
            cooling_level,
        };
        power.validate()?;
        Ok(power)
    }

    /// Probe the current host.
    ///
    /// /proc/meminfo under-reports total memory because of kernel
    /// reservations, so the value is rounded up to the next GiB.
    pub fn auto_detect() -> Self {
        let cpu_core_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        let memory_size = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| {
                text.lines().find_map(|line| {
                    let rest = line.strip_prefix("MemTotal:")?;
                    rest.split_whitespace().next()?.parse::<u64>().ok()
                })
            })
            .map(|kib| (kib * 1024 / GIB + 1) * GIB)
            .unwrap_or(GIB);

        Self {
            cpu_core_count,
            memory_size,
            cooling_level: 5,
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.cpu_core_count == 0 {
            return Err(SettingsError("cpu_core_count must be at least 1".into()));
        }
        if self.memory_size == 0 {
            return Err(SettingsError("memory_size must be at least 1".into()));
        }
        if !(1..=10).contains(&self.cooling_level) {
            return Err(SettingsError("cooling_level must be within 1-10".into()));
        }
        Ok(())
    }

    /// (-j, -l) values for make.
    ///
    /// Weak cooling pins everything to 1; plenty of memory allows
    /// overcommitting jobs beyond the core count.
    pub fn make_jobs(&self) -> (u32, u32) {
        if self.cooling_level <= 1 {
            return (1, 1);
        }
        if self.memory_size >= 24 * GIB {
            (self.cpu_core_count + 2, self.cpu_core_count)
        } else {
            (self.cpu_core_count, self.cpu_core_count.saturating_sub(1).max(1))
        }
    }

    /// (--jobs, --load-average) values for emerge.
    pub fn emerge_jobs(&self) -> (u32, u32) {
        if self.cooling_level <= 1 {
            return (1, 1);
        }
        let (_, load) = self.make_jobs();
        (self.cpu_core_count, load)
    }
}

/// Mapping from in-chroot uids/gids to host ones.
///
/// Identity unless the build runs through user namespaces; either way the
/// chroot's root must map to the invoking user, since that user owns the
/// work directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdMap {
    pub uid_map: BTreeMap<u32, u32>,
    pub gid_map: BTreeMap<u32, u32>,
}

impl IdMap {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn conv_uid(&self, uid: u32) -> Result<u32, SettingsError> {
        if self.uid_map.is_empty() {
            return Ok(uid);
        }
        self.uid_map
            .get(&uid)
            .copied()
            .ok_or_else(|| SettingsError(format!("uid {uid} not found in uid map")))
    }

    pub fn conv_gid(&self, gid: u32) -> Result<u32, SettingsError> {
        if self.gid_map.is_empty() {
            return Ok(gid);
        }
        self.gid_map
            .get(&gid)
            .copied()
            .ok_or_else(|| SettingsError(format!("gid {gid} not found in gid map")))
    }

    /// Root inside the chroot must resolve to the user running the build.
    pub fn verify_root_mapping(&self) -> Result<(), SettingsError> {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        if self.conv_uid(0)? != uid || self.conv_gid(0)? != gid {
            return Err(SettingsError(
                "chroot root does not map to the invoking user".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power(cores: u32, mem_gib: u64, cooling: u8) -> ComputingPower {
        ComputingPower::new(cores, mem_gib * GIB, cooling).unwrap()
    }

    #[test]
    fn test_make_jobs_weak_cooling_is_serial() {
        assert_eq!(power(16, 64, 1).make_jobs(), (1, 1));
    }

    #[test]
    fn test_make_jobs_large_memory_overcommits() {
        assert_eq!(power(8, 32, 5).make_jobs(), (10, 8));
    }

    #[test]
    fn test_make_jobs_small_memory() {
        assert_eq!(power(8, 16, 5).make_jobs(), (8, 7));
        assert_eq!(power(1, 16, 5).make_jobs(), (1, 1));
    }

    #[test]
    fn test_emerge_jobs() {
        assert_eq!(power(8, 16, 5).emerge_jobs(), (8, 7));
        assert_eq!(power(8, 16, 1).emerge_jobs(), (1, 1));
    }

    #[test]
    fn test_computing_power_validation() {
        assert!(ComputingPower::new(0, GIB, 5).is_err());
        assert!(ComputingPower::new(4, GIB, 11).is_err());
        assert!(ComputingPower::new(4, GIB, 10).is_ok());
    }

    #[test]
    fn test_auto_detect_is_sane() {
        let detected = ComputingPower::auto_detect();
        assert!(detected.validate().is_ok());
        assert!(detected.memory_size >= GIB);
    }

    #[test]
    fn test_target_settings_overlap_rejected() {
        let mut target = TargetSettings::default();
        target.install_list.push("dev-util/ccache".into());
        target.world_set.push("dev-util/ccache".into());
        assert!(target.validate().is_err());
    }

    #[test]
    fn test_identity_id_map_passes_values_through() {
        let map = IdMap::identity();
        assert_eq!(map.conv_uid(123).unwrap(), 123);
        assert_eq!(map.conv_gid(0).unwrap(), 0);
    }

    #[test]
    fn test_explicit_id_map() {
        let mut map = IdMap::identity();
        map.uid_map.insert(0, 1000);
        assert_eq!(map.conv_uid(0).unwrap(), 1000);
        assert!(map.conv_uid(5).is_err());
    }

    #[test]
    fn test_root_mapping_verification() {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        let mut map = IdMap::identity();
        map.uid_map.insert(0, uid);
        map.gid_map.insert(0, gid);
        assert!(map.verify_root_mapping().is_ok());

        let mut wrong = IdMap::identity();
        wrong.uid_map.insert(0, uid.wrapping_add(1));
        wrong.gid_map.insert(0, gid);
        assert!(wrong.verify_root_mapping().is_err());
    }
}
