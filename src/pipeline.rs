//! The build pipeline: a fixed sequence of named steps, each made atomic
//! with respect to crash/resume by the work directory's checkpointing.
//!
//! Progress is an explicit `PipelineState` value persisted after every
//! successful action, never implicit shared state. An action that fails
//! leaves its unsealed `cur/` directory behind for inspection and does not
//! advance progress, so re-invoking the pipeline retries the same action
//! from the last sealed checkpoint.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{PreconditionError, WorkDirError};
use crate::workdir::WorkDir;

pub const PROGRESS_RECORD: &str = "progress.json";

/// Steps of the stage build, in execution order.
///
/// `KernelInstalled` is an optional branch: enabling services accepts both
/// `WorldUpdated` and `KernelInstalled` as predecessors, merging the branch
/// back into the main sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStep {
    Init,
    Unpacked,
    RepositoriesReady,
    ConfReady,
    WorldUpdated,
    KernelInstalled,
    ServicesEnabled,
    Customized,
    CleanedUp,
}

impl BuildStep {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BuildStep::Init => "INIT",
            BuildStep::Unpacked => "UNPACKED",
            BuildStep::RepositoriesReady => "REPOSITORIES_READY",
            BuildStep::ConfReady => "CONF_READY",
            BuildStep::WorldUpdated => "WORLD_UPDATED",
            BuildStep::KernelInstalled => "KERNEL_INSTALLED",
            BuildStep::ServicesEnabled => "SERVICES_ENABLED",
            BuildStep::Customized => "CUSTOMIZED",
            BuildStep::CleanedUp => "CLEANED_UP",
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Explicit pipeline state: the reached step and the checkpoint sealed for
/// it (`None` before the first action completes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    pub step: BuildStep,
    pub checkpoint: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ProgressRecord {
    step: BuildStep,
    checkpoint: Option<String>,
    updated_at_utc: String,
}

/// Name of the checkpoint sealed when an action starting at `from`
/// completes step `to`, e.g. `00-UNPACKED`.
pub fn checkpoint_name(from: BuildStep, to: BuildStep) -> String {
    format!("{:02}-{}", from.index(), to.name())
}

/// Sequencer of build actions over a work directory.
#[derive(Debug)]
pub struct BuildPipeline {
    work_dir: WorkDir,
    state: PipelineState,
}

impl BuildPipeline {
    /// Start a fresh pipeline at `INIT` and persist the marker.
    pub fn create(work_dir: WorkDir) -> Result<Self> {
        let pipeline = Self {
            work_dir,
            state: PipelineState {
                step: BuildStep::Init,
                checkpoint: None,
            },
        };
        pipeline.persist()?;
        Ok(pipeline)
    }

    /// Reload a pipeline from its persisted marker, validating the recorded
    /// checkpoint against the on-disk checkpoint history.
    pub fn resume(work_dir: WorkDir) -> Result<Self> {
        let record: ProgressRecord = work_dir
            .load_record(PROGRESS_RECORD)
            .context("loading pipeline progress")?;

        if let Some(name) = &record.checkpoint {
            let known = work_dir.list_checkpoints()?.iter().any(|c| c == name);
            // Under the rename strategy a crash mid-action leaves the
            // checkpoint consumed into cur/; adopting that directory is the
            // only way forward, so its presence stands in for the name.
            if !known && !work_dir.has_current() {
                return Err(WorkDirError::UnknownCheckpoint(name.clone()).into());
            }
        }

        Ok(Self {
            work_dir,
            state: PipelineState {
                step: record.step,
                checkpoint: record.checkpoint,
            },
        })
    }

    pub fn progress(&self) -> BuildStep {
        self.state.step
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    /// Run one action: precondition check, checkpoint open, body, seal,
    /// advance.
    ///
    /// On failure the opened-but-unsealed `cur/` is left in place so an
    /// operator can inspect it; the next invocation recovers it (discard
    /// and re-copy under the copy strategy, adopt under rename).
    pub fn run_action<F>(&mut self, expected: &[BuildStep], next: BuildStep, body: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if !expected.contains(&self.state.step) {
            return Err(PreconditionError {
                expected: expected.to_vec(),
                actual: self.state.step,
            }
            .into());
        }
        debug_assert!(expected.iter().all(|step| *step < next));

        if self.work_dir.has_current() {
            if self.work_dir.strategy().preserves_sealed() {
                println!("[pipeline] discarding unsealed chroot directory from a failed attempt");
                self.work_dir.discard_current()?;
            } else {
                println!("[pipeline] adopting unsealed chroot directory from a failed attempt");
            }
        }
        if !self.work_dir.has_current() {
            self.work_dir
                .open_checkpoint(self.state.checkpoint.as_deref())?;
        }

        let chroot_dir = self.work_dir.current_dir_path()?;
        body(&chroot_dir)?;

        let sealed = checkpoint_name(self.state.step, next);
        self.work_dir.seal_checkpoint(&sealed)?;
        self.state = PipelineState {
            step: next,
            checkpoint: Some(sealed),
        };
        self.persist()?;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let record = ProgressRecord {
            step: self.state.step,
            checkpoint: self.state.checkpoint.clone(),
            updated_at_utc: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .context("formatting progress timestamp")?,
        };
        self.work_dir.save_record(PROGRESS_RECORD, &record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PreconditionError;
    use crate::workdir::CheckpointStrategy;
    use anyhow::bail;
    use std::fs;
    use tempfile::TempDir;

    fn pipeline(temp: &TempDir, strategy: CheckpointStrategy) -> BuildPipeline {
        let wd = WorkDir::new(temp.path().join("work"), strategy);
        wd.initialize().unwrap();
        BuildPipeline::create(wd).unwrap()
    }

    #[test]
    fn test_step_serde_names() {
        let json = serde_json::to_string(&BuildStep::RepositoriesReady).unwrap();
        assert_eq!(json, "\"REPOSITORIES_READY\"");
        let step: BuildStep = serde_json::from_str("\"WORLD_UPDATED\"").unwrap();
        assert_eq!(step, BuildStep::WorldUpdated);
    }

    #[test]
    fn test_checkpoint_name() {
        assert_eq!(
            checkpoint_name(BuildStep::Init, BuildStep::Unpacked),
            "00-UNPACKED"
        );
        assert_eq!(
            checkpoint_name(BuildStep::KernelInstalled, BuildStep::ServicesEnabled),
            "05-SERVICES_ENABLED"
        );
    }

    #[test]
    fn test_first_action_advances_and_seals() {
        let temp = TempDir::new().unwrap();
        let mut pipeline = pipeline(&temp, CheckpointStrategy::Copy);

        pipeline
            .run_action(&[BuildStep::Init], BuildStep::Unpacked, |chroot| {
                fs::write(chroot.join("seed-marker"), "unpacked").unwrap();
                Ok(())
            })
            .unwrap();

        assert_eq!(pipeline.progress(), BuildStep::Unpacked);
        assert_eq!(
            pipeline.work_dir().list_checkpoints().unwrap(),
            vec!["00-UNPACKED".to_string()]
        );
        assert!(pipeline
            .work_dir()
            .checkpoint_path("00-UNPACKED")
            .join("seed-marker")
            .exists());
        assert!(!pipeline.work_dir().has_current());
    }

    #[test]
    fn test_wrong_step_is_a_precondition_error() {
        let temp = TempDir::new().unwrap();
        let mut pipeline = pipeline(&temp, CheckpointStrategy::Copy);

        let err = pipeline
            .run_action(&[BuildStep::Unpacked], BuildStep::RepositoriesReady, |_| {
                Ok(())
            })
            .unwrap_err();
        assert!(err.downcast_ref::<PreconditionError>().is_some());
    }

    #[test]
    fn test_repeated_action_is_a_precondition_error() {
        let temp = TempDir::new().unwrap();
        let mut pipeline = pipeline(&temp, CheckpointStrategy::Copy);

        pipeline
            .run_action(&[BuildStep::Init], BuildStep::Unpacked, |_| Ok(()))
            .unwrap();
        let err = pipeline
            .run_action(&[BuildStep::Init], BuildStep::Unpacked, |_| Ok(()))
            .unwrap_err();
        assert!(err.downcast_ref::<PreconditionError>().is_some());
    }

    #[test]
    fn test_failed_body_keeps_progress_and_cur() {
        let temp = TempDir::new().unwrap();
        let mut pipeline = pipeline(&temp, CheckpointStrategy::Copy);

        let err = pipeline
            .run_action(&[BuildStep::Init], BuildStep::Unpacked, |chroot| {
                fs::write(chroot.join("partial"), "x").unwrap();
                bail!("seed archive is corrupt")
            })
            .unwrap_err();
        assert!(err.to_string().contains("corrupt"));

        assert_eq!(pipeline.progress(), BuildStep::Init);
        assert!(pipeline.work_dir().list_checkpoints().unwrap().is_empty());
        // The half-mutated directory stays for inspection.
        let cur = pipeline.work_dir().current_dir_path().unwrap();
        assert!(cur.join("partial").exists());
    }

    #[test]
    fn test_retry_does_not_see_partial_effects() {
        let temp = TempDir::new().unwrap();
        let mut pipeline = pipeline(&temp, CheckpointStrategy::Copy);

        pipeline
            .run_action(&[BuildStep::Init], BuildStep::Unpacked, |chroot| {
                fs::write(chroot.join("base"), "ok").unwrap();
                Ok(())
            })
            .unwrap();

        let _ = pipeline
            .run_action(
                &[BuildStep::Unpacked],
                BuildStep::RepositoriesReady,
                |chroot| {
                    fs::write(chroot.join("sentinel"), "half done").unwrap();
                    bail!("sync interrupted")
                },
            )
            .unwrap_err();

        pipeline
            .run_action(
                &[BuildStep::Unpacked],
                BuildStep::RepositoriesReady,
                |chroot| {
                    assert!(chroot.join("base").exists());
                    assert!(!chroot.join("sentinel").exists());
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(pipeline.progress(), BuildStep::RepositoriesReady);
    }

    #[test]
    fn test_rename_strategy_adopts_failed_attempt() {
        let temp = TempDir::new().unwrap();
        let mut pipeline = pipeline(&temp, CheckpointStrategy::Rename);

        pipeline
            .run_action(&[BuildStep::Init], BuildStep::Unpacked, |_| Ok(()))
            .unwrap();
        let _ = pipeline
            .run_action(
                &[BuildStep::Unpacked],
                BuildStep::RepositoriesReady,
                |chroot| {
                    fs::write(chroot.join("sentinel"), "x").unwrap();
                    bail!("boom")
                },
            )
            .unwrap_err();

        // The predecessor was consumed by the rename, so the retry keeps
        // working in the adopted directory.
        pipeline
            .run_action(
                &[BuildStep::Unpacked],
                BuildStep::RepositoriesReady,
                |chroot| {
                    assert!(chroot.join("sentinel").exists());
                    Ok(())
                },
            )
            .unwrap();
    }

    #[test]
    fn test_optional_branch_merge() {
        let temp = TempDir::new().unwrap();
        let mut pipeline = pipeline(&temp, CheckpointStrategy::Copy);

        for (expected, next) in [
            (BuildStep::Init, BuildStep::Unpacked),
            (BuildStep::Unpacked, BuildStep::RepositoriesReady),
            (BuildStep::RepositoriesReady, BuildStep::ConfReady),
            (BuildStep::ConfReady, BuildStep::WorldUpdated),
        ] {
            pipeline.run_action(&[expected], next, |_| Ok(())).unwrap();
        }

        // Enable-services accepts the merge of the optional kernel branch:
        // here the kernel step is skipped.
        pipeline
            .run_action(
                &[BuildStep::WorldUpdated, BuildStep::KernelInstalled],
                BuildStep::ServicesEnabled,
                |_| Ok(()),
            )
            .unwrap();
        assert_eq!(pipeline.progress(), BuildStep::ServicesEnabled);
        assert_eq!(
            pipeline.state().checkpoint.as_deref(),
            Some("04-SERVICES_ENABLED")
        );
    }

    #[test]
    fn test_resume_restores_state() {
        let temp = TempDir::new().unwrap();
        let wd = WorkDir::new(temp.path().join("work"), CheckpointStrategy::Copy);
        wd.initialize().unwrap();

        {
            let mut pipeline = BuildPipeline::create(wd.clone()).unwrap();
            pipeline
                .run_action(&[BuildStep::Init], BuildStep::Unpacked, |_| Ok(()))
                .unwrap();
        }

        let resumed = BuildPipeline::resume(wd).unwrap();
        assert_eq!(resumed.progress(), BuildStep::Unpacked);
        assert_eq!(resumed.state().checkpoint.as_deref(), Some("00-UNPACKED"));
    }

    #[test]
    fn test_resume_rejects_vanished_checkpoint() {
        let temp = TempDir::new().unwrap();
        let wd = WorkDir::new(temp.path().join("work"), CheckpointStrategy::Copy);
        wd.initialize().unwrap();

        {
            let mut pipeline = BuildPipeline::create(wd.clone()).unwrap();
            pipeline
                .run_action(&[BuildStep::Init], BuildStep::Unpacked, |_| Ok(()))
                .unwrap();
        }
        fs::remove_dir_all(wd.checkpoint_path("00-UNPACKED")).unwrap();

        let err = BuildPipeline::resume(wd).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkDirError>(),
            Some(WorkDirError::UnknownCheckpoint(_))
        ));
    }
}
