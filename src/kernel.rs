//! Kernel installer plugins.
//!
//! Gentoo has no single way to build a kernel; installers are pluggable and
//! run their own chroot session against the currently open chroot
//! directory.

use anyhow::Result;

use crate::chroot::ChrootSession;
use crate::settings::{ComputingPower, Settings};
use crate::workdir::WorkDir;

pub trait KernelInstaller {
    fn install(
        &self,
        settings: &Settings,
        power: &ComputingPower,
        work_dir: &WorkDir,
    ) -> Result<()>;
}

/// Build kernel and initramfs with sys-kernel/genkernel.
pub struct Genkernel {
    ccache: bool,
}

impl Genkernel {
    pub fn new(ccache: bool) -> Self {
        Self { ccache }
    }
}

impl KernelInstaller for Genkernel {
    fn install(
        &self,
        _settings: &Settings,
        power: &ComputingPower,
        work_dir: &WorkDir,
    ) -> Result<()> {
        let chroot_dir = work_dir.current_dir_path()?;
        let (jobs, load) = power.make_jobs();

        let mut session = ChrootSession::new(chroot_dir);
        session.bind()?;
        session.run(&[], "eselect kernel set 1")?;

        let mut env: Vec<(&str, &str)> = Vec::new();
        let mut command = format!("genkernel --no-mountboot --makeopts='-j{jobs} -l{load}'");
        if self.ccache {
            env.push(("CCACHE_DIR", "/var/tmp/ccache"));
            command.push_str(" --kernel-cc=/usr/lib/ccache/bin/gcc --utils-cc=/usr/lib/ccache/bin/gcc");
        }
        command.push_str(" all");

        session.run_streamed(&env, &command)?;
        session.unbind();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workdir::CheckpointStrategy;
    use tempfile::TempDir;

    #[test]
    fn test_install_requires_open_chroot_dir() {
        let temp = TempDir::new().unwrap();
        let wd = WorkDir::new(temp.path().join("work"), CheckpointStrategy::Copy);
        wd.initialize().unwrap();

        let settings = Settings::new(
            "stage-builder",
            ComputingPower::new(4, 8 * 1024 * 1024 * 1024, 5).unwrap(),
        );
        let installer = Genkernel::new(false);
        let err = installer
            .install(&settings, &settings.host_computing_power, &wd)
            .unwrap_err();
        assert!(err
            .downcast_ref::<crate::error::WorkDirError>()
            .is_some());
    }
}
