//! Checkpointed chroot pipeline for building Gentoo stage root filesystems.
//!
//! A stage is assembled by a fixed sequence of chroot-executed steps:
//! unpack a seed archive, provision package repositories, write the portage
//! configuration, update the installed set, optionally install a kernel,
//! enable services, customize, clean up. Three subsystems carry the real
//! invariants:
//!
//! - **[`workdir::WorkDir`]** - owns the build root on disk: one unsealed
//!   `cur/` chroot directory at a time plus sealed, immutable checkpoints.
//! - **[`chroot::ChrootSession`]** - binds host resources (proc/sys/dev/tmp,
//!   caches, repositories) into a chroot directory for one step and
//!   guarantees symmetric teardown.
//! - **[`pipeline::BuildPipeline`]** - orders the steps, enforcing
//!   preconditions and sealing a checkpoint only after a step succeeds, so
//!   a crashed or failed build resumes from the last good checkpoint.
//!
//! ```text
//! Builder action
//!     └── BuildPipeline::run_action
//!             ├── WorkDir::open_checkpoint     (from last sealed)
//!             ├── step body
//!             │       └── ChrootSession        (bind → run → unbind)
//!             └── WorkDir::seal_checkpoint     (only on success)
//! ```
//!
//! Everything else - seed stages, repository descriptors, the portage
//! config writers, kernel installers, exporters - plugs into those three
//! through the traits in [`seed`], [`repos`], [`chroot::script`],
//! [`kernel`] and [`export`].

pub mod builder;
pub mod chroot;
pub mod confdir;
pub mod config;
pub mod error;
pub mod export;
pub mod filesystem;
pub mod kernel;
pub mod paths;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod repos;
pub mod seed;
pub mod settings;
pub mod workdir;

pub use builder::Builder;
pub use chroot::{ChrootSession, HostBind, MountBinding, ScriptInChroot};
pub use error::{CommandError, MountError, PreconditionError, SettingsError, WorkDirError};
pub use pipeline::{BuildPipeline, BuildStep, PipelineState};
pub use repos::{Repository, RepositorySource};
pub use seed::{SeedStage, Stage3Archive};
pub use settings::{ComputingPower, IdMap, Settings, TargetSettings};
pub use workdir::{CheckpointStrategy, WorkDir};
