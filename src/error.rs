//! Typed errors for the core subsystems.
//!
//! The work directory, chroot session and pipeline report structured errors
//! so callers can tell a misconfigured directory from a failed command from
//! a violated step precondition. Application-level code composes them with
//! `anyhow` and recovers the concrete type by downcast where it matters.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::pipeline::BuildStep;

/// Work-directory structure, ownership or lifecycle violation.
///
/// These are fatal: the directory is used as a chroot target and mount
/// point under elevated privilege, so a mismatch is treated as a
/// misconfiguration rather than something to retry around.
#[derive(Debug, Error)]
pub enum WorkDirError {
    #[error("\"{}\" is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("invalid mode {found:04o} for \"{}\" (expected {expected:04o})", path.display())]
    BadMode {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("invalid owner {uid}:{gid} for \"{}\"", path.display())]
    BadOwner { path: PathBuf, uid: u32, gid: u32 },

    #[error("a chroot directory is already open in \"{}\"", .0.display())]
    CurrentExists(PathBuf),

    #[error("no chroot directory is currently open in \"{}\"", .0.display())]
    NoCurrent(PathBuf),

    #[error("unknown checkpoint \"{0}\"")]
    UnknownCheckpoint(String),

    #[error("checkpoint name \"{0}\" is already taken")]
    NameCollision(String),

    #[error("reserved name \"{0}\" cannot be used for a checkpoint")]
    ReservedName(String),
}

/// An action was invoked while the pipeline is at the wrong step.
#[derive(Debug, Error)]
#[error("pipeline is at {actual}, expected one of [{}]",
        expected.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", "))]
pub struct PreconditionError {
    pub expected: Vec<BuildStep>,
    pub actual: BuildStep,
}

/// A command run inside the chroot exited non-zero.
#[derive(Debug, Error)]
#[error("chroot command `{command}` failed ({status})")]
pub struct CommandError {
    pub command: String,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// A bind or unmount operation failed, or the session was used out of state.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("chroot session is already bound")]
    AlreadyBound,

    #[error("chroot session is not bound")]
    NotBound,

    #[error("mount point \"{}\" does not exist", .0.display())]
    MissingMountPoint(PathBuf),

    #[error("\"{}\" is already mounted", .0.display())]
    AlreadyMounted(PathBuf),

    #[error("mounting \"{}\" failed: {detail}", target.display())]
    MountFailed { target: PathBuf, detail: String },

    #[error("chroot session setup failed: {0}")]
    Setup(String),
}

/// Invalid host or target settings.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SettingsError(pub String);
