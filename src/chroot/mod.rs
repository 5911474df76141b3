//! Chroot sessions: bind host resources into a chroot directory for the
//! duration of one step, run commands inside it, and leave no residue.
//!
//! A session is UNBOUND until `bind()` succeeds and returns to UNBOUND via
//! `unbind()`. `bind()` acquires mounts in a fixed order and unwinds
//! everything acquired so far if any step fails, so partial success is never
//! observable. Teardown is strict LIFO with lazy unmounts; a stuck mount is
//! reported and skipped rather than allowed to leak every mount behind it.
//! Dropping a bound session unbinds it.

pub mod script;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crate::error::{CommandError, MountError};
use crate::filesystem::is_mount_point;
use crate::paths::host_path;
use crate::process::Cmd;

pub use script::{ScriptFromBuffer, ScriptFromHostFile, ScriptInChroot};

/// A host directory bound into the chroot for the session's duration.
#[derive(Debug, Clone)]
pub struct HostBind {
    pub host_dir: PathBuf,
    /// Absolute path inside the chroot.
    pub target: String,
    pub read_only: bool,
}

/// One mount created by the session. Creation order is the reverse of the
/// required teardown order; the session owns its bindings exclusively.
#[derive(Debug, Clone)]
pub struct MountBinding {
    pub source: String,
    pub target: PathBuf,
    pub options: String,
}

pub struct ChrootSession {
    chroot_dir: PathBuf,
    extra_binds: Vec<HostBind>,
    bindings: Vec<MountBinding>,
    ephemeral_files: Vec<PathBuf>,
    script_seq: u32,
    bound: bool,
}

impl ChrootSession {
    pub fn new(chroot_dir: impl Into<PathBuf>) -> Self {
        Self {
            chroot_dir: chroot_dir.into(),
            extra_binds: Vec::new(),
            bindings: Vec::new(),
            ephemeral_files: Vec::new(),
            script_seq: 0,
            bound: false,
        }
    }

    /// Queue an optional host bind, mounted after the kernel filesystems in
    /// the order added.
    pub fn add_bind(&mut self, bind: HostBind) {
        self.extra_binds.push(bind);
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn chroot_dir(&self) -> &Path {
        &self.chroot_dir
    }

    pub fn bindings(&self) -> &[MountBinding] {
        &self.bindings
    }

    /// Bind host resources into the chroot.
    ///
    /// Order: `/proc`, `/sys` (recursive, slave), `/dev` (recursive, slave),
    /// `/tmp` (fresh tmpfs), then the queued host binds. Any failure unwinds
    /// all mounts created so far and surfaces the original error.
    pub fn bind(&mut self) -> Result<(), MountError> {
        if self.bound {
            return Err(MountError::AlreadyBound);
        }

        if let Err(err) = self.bind_all() {
            self.unbind();
            return Err(err);
        }

        self.bound = true;
        Ok(())
    }

    fn bind_all(&mut self) -> Result<(), MountError> {
        self.stage_resolv_conf()?;

        self.mount("proc", "/proc", &["-t", "proc"], "proc")?;

        self.mount("/sys", "/sys", &["--rbind"], "rbind,rslave")?;
        self.make_rslave("/sys")?;

        self.mount("/dev", "/dev", &["--rbind"], "rbind,rslave")?;
        self.make_rslave("/dev")?;

        self.mount("tmpfs", "/tmp", &["-t", "tmpfs"], "tmpfs")?;

        let binds = self.extra_binds.clone();
        for bind in &binds {
            let source = bind.host_dir.display().to_string();
            if bind.read_only {
                self.mount(&source, &bind.target, &["--bind", "-o", "ro"], "bind,ro")?;
            } else {
                self.mount(&source, &bind.target, &["--bind"], "bind")?;
            }
        }

        Ok(())
    }

    /// Tear down all recorded bindings in reverse order, best effort, and
    /// remove files staged for the session. Safe to call in any state.
    pub fn unbind(&mut self) {
        while let Some(binding) = self.bindings.pop() {
            match is_mount_point(&binding.target) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    eprintln!(
                        "[chroot] cannot inspect mount '{}': {err}",
                        binding.target.display()
                    );
                }
            }
            let result = Cmd::new("umount")
                .arg("-l")
                .arg_path(&binding.target)
                .allow_fail()
                .run();
            match result {
                Ok(out) if !out.success() => eprintln!(
                    "[chroot] failed to unmount '{}': {}",
                    binding.target.display(),
                    out.stderr.trim()
                ),
                Err(err) => eprintln!(
                    "[chroot] failed to unmount '{}': {err}",
                    binding.target.display()
                ),
                Ok(_) => {}
            }
        }

        for file in self.ephemeral_files.drain(..) {
            let _ = fs::remove_file(&file);
        }

        self.bound = false;
    }

    /// Run a command inside the chroot, capturing its output.
    pub fn run(&self, env: &[(&str, &str)], cmd: &str) -> Result<String> {
        if !self.bound {
            return Err(MountError::NotBound.into());
        }

        let output = self
            .chroot_command(env, cmd)
            .output()
            .with_context(|| format!("spawning chroot command `{cmd}`"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(CommandError {
                command: cmd.to_string(),
                status: output.status,
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(stdout)
    }

    /// Run a command inside the chroot with inherited stdio, for package
    /// builds and other long-running work whose output belongs on the
    /// terminal.
    pub fn run_streamed(&self, env: &[(&str, &str)], cmd: &str) -> Result<()> {
        if !self.bound {
            return Err(MountError::NotBound.into());
        }
        println!("[chroot] {cmd}");

        let status = self
            .chroot_command(env, cmd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("spawning chroot command `{cmd}`"))?;

        if !status.success() {
            return Err(CommandError {
                command: cmd.to_string(),
                status,
                stdout: String::new(),
                stderr: String::new(),
            }
            .into());
        }
        Ok(())
    }

    /// Materialize a script directory under the chroot's /tmp, execute the
    /// script, and remove the directory again whatever the outcome.
    pub fn run_script(&mut self, script: &dyn ScriptInChroot) -> Result<()> {
        if !self.bound {
            return Err(MountError::NotBound.into());
        }

        self.script_seq += 1;
        let dir_in_chroot = format!("/tmp/stage-script-{:02}", self.script_seq);
        let host_dir = host_path(&self.chroot_dir, &dir_in_chroot);

        fs::create_dir(&host_dir)
            .with_context(|| format!("creating script directory '{}'", host_dir.display()))?;
        fs::set_permissions(&host_dir, fs::Permissions::from_mode(0o755))?;

        println!("[chroot] {}", script.description());
        let result = script
            .fill_script_dir(&host_dir)
            .with_context(|| format!("filling script directory '{}'", host_dir.display()))
            .and_then(|()| {
                self.run_streamed(&[], &format!("{}/{}", dir_in_chroot, script.script_name()))
            });

        let _ = fs::remove_dir_all(&host_dir);
        result
    }

    fn chroot_command(&self, env: &[(&str, &str)], cmd: &str) -> Command {
        let mut command = Command::new("chroot");
        command
            .arg(&self.chroot_dir)
            .arg("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .env("LANG", "C.UTF-8");
        for (key, value) in env {
            command.env(key, value);
        }
        command
    }

    /// emerge needs a resolver inside the chroot; the copy is removed again
    /// at unbind so it never leaks into a sealed checkpoint.
    fn stage_resolv_conf(&mut self) -> Result<(), MountError> {
        let host_conf = Path::new("/etc/resolv.conf");
        let etc_dir = self.chroot_dir.join("etc");
        if !host_conf.exists() || !etc_dir.is_dir() {
            return Ok(());
        }

        let staged = etc_dir.join("resolv.conf");
        fs::copy(host_conf, &staged)
            .map_err(|err| MountError::Setup(format!("staging resolv.conf: {err}")))?;
        self.ephemeral_files.push(staged);
        Ok(())
    }

    fn mount(
        &mut self,
        source: &str,
        target_in_chroot: &str,
        mount_args: &[&str],
        options: &str,
    ) -> Result<(), MountError> {
        let target = host_path(&self.chroot_dir, target_in_chroot);

        if !target.exists() {
            return Err(MountError::MissingMountPoint(target));
        }
        match is_mount_point(&target) {
            Ok(false) => {}
            Ok(true) => return Err(MountError::AlreadyMounted(target)),
            Err(err) => {
                return Err(MountError::Setup(format!(
                    "inspecting mount point '{}': {err}",
                    target.display()
                )))
            }
        }

        let result = Cmd::new("mount")
            .args(mount_args)
            .arg(source)
            .arg_path(&target)
            .allow_fail()
            .run();
        match result {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return Err(MountError::MountFailed {
                    target,
                    detail: out.stderr.trim().to_string(),
                })
            }
            Err(err) => {
                return Err(MountError::MountFailed {
                    target,
                    detail: err.to_string(),
                })
            }
        }

        self.bindings.push(MountBinding {
            source: source.to_string(),
            target,
            options: options.to_string(),
        });
        Ok(())
    }

    fn make_rslave(&self, target_in_chroot: &str) -> Result<(), MountError> {
        let target = host_path(&self.chroot_dir, target_in_chroot);
        let result = Cmd::new("mount")
            .arg("--make-rslave")
            .arg_path(&target)
            .allow_fail()
            .run();
        match result {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(MountError::MountFailed {
                target,
                detail: out.stderr.trim().to_string(),
            }),
            Err(err) => Err(MountError::MountFailed {
                target,
                detail: err.to_string(),
            }),
        }
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if self.bound {
            self.unbind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chroot_skeleton(temp: &TempDir) -> PathBuf {
        let chroot = temp.path().join("chroot");
        fs::create_dir_all(chroot.join("etc")).unwrap();
        chroot
    }

    #[test]
    fn test_run_requires_bound() {
        let temp = TempDir::new().unwrap();
        let session = ChrootSession::new(chroot_skeleton(&temp));
        let err = session.run(&[], "true").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MountError>(),
            Some(MountError::NotBound)
        ));
    }

    #[test]
    fn test_run_script_requires_bound() {
        let temp = TempDir::new().unwrap();
        let mut session = ChrootSession::new(chroot_skeleton(&temp));
        let script = ScriptFromBuffer::new("noop", "#!/bin/sh\ntrue\n");
        assert!(session.run_script(&script).is_err());
    }

    #[test]
    fn test_partial_bind_unwinds_cleanly() {
        // The skeleton has /etc but no /proc, so the very first mount fails
        // before anything was acquired; the session must come back unbound,
        // with no recorded bindings and the staged resolv.conf removed.
        let temp = TempDir::new().unwrap();
        let chroot = chroot_skeleton(&temp);
        let mut session = ChrootSession::new(&chroot);

        let err = session.bind().unwrap_err();
        assert!(matches!(err, MountError::MissingMountPoint(_)));
        assert!(!session.is_bound());
        assert!(session.bindings().is_empty());
        if Path::new("/etc/resolv.conf").exists() {
            assert!(!chroot.join("etc/resolv.conf").exists());
        }
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut session = ChrootSession::new(chroot_skeleton(&temp));
        session.unbind();
        session.unbind();
        assert!(!session.is_bound());
    }

    #[test]
    fn test_binds_are_queued_in_order() {
        let temp = TempDir::new().unwrap();
        let mut session = ChrootSession::new(chroot_skeleton(&temp));
        session.add_bind(HostBind {
            host_dir: "/srv/distfiles".into(),
            target: "/var/cache/distfiles".into(),
            read_only: false,
        });
        session.add_bind(HostBind {
            host_dir: "/srv/repo".into(),
            target: "/var/db/repos/gentoo".into(),
            read_only: true,
        });
        assert_eq!(session.extra_binds.len(), 2);
        assert_eq!(session.extra_binds[1].target, "/var/db/repos/gentoo");
        assert!(session.extra_binds[1].read_only);
    }
}
