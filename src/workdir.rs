//! The on-disk build root: one "current" chroot directory plus sealed,
//! immutable checkpoints.
//!
//! The work directory is created with a fixed restrictive mode and its
//! ownership is re-verified on every open, since its contents are used as
//! chroot and mount targets under elevated privilege. At most one unsealed
//! `cur/` directory exists at any time; that single slot is what makes
//! pipeline actions look atomic from the outside.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!     cur/                  currently open chroot directory (mid-action only)
//!     00-UNPACKED/          sealed checkpoints, ordinal-prefixed
//!     01-REPOSITORIES_READY/
//!     settings.json         persisted host settings
//!     target.json           persisted target settings
//!     id_map.json           chroot uid/gid mapping
//!     progress.json         pipeline progress marker
//! ```

use std::fs;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WorkDirError;
use crate::filesystem::{copy_dir_recursive, truncate_dir};

const CURRENT_DIR_NAME: &str = "cur";
const WORK_DIR_MODE: u32 = 0o700;

/// How `open_checkpoint` turns a sealed checkpoint into the current
/// chroot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStrategy {
    /// Atomic rename. Fast, but consumes the sealed checkpoint; an empty
    /// tombstone file keeps the old name from ever being reused.
    Rename,
    /// Full recursive copy. Sealed checkpoints stay intact, so a failed
    /// action can always be retried from pristine state.
    Copy,
}

impl CheckpointStrategy {
    /// Whether sealed checkpoints survive being opened.
    pub fn preserves_sealed(self) -> bool {
        matches!(self, CheckpointStrategy::Copy)
    }
}

/// Handle to a build work directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
    strategy: CheckpointStrategy,
}

impl WorkDir {
    pub fn new(path: impl Into<PathBuf>, strategy: CheckpointStrategy) -> Self {
        Self {
            path: path.into(),
            strategy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn strategy(&self) -> CheckpointStrategy {
        self.strategy
    }

    /// Checkpointing via filesystem snapshots (btrfs/bcachefs subvolumes)
    /// would slot in as a third strategy; no backend exists yet.
    pub fn supports_snapshot_checkpoints(&self) -> bool {
        false
    }

    /// Verify directory type, exact permission bits and ownership.
    pub fn verify(&self) -> Result<(), WorkDirError> {
        let meta = fs::metadata(&self.path)
            .map_err(|_| WorkDirError::NotADirectory(self.path.clone()))?;
        if !meta.is_dir() {
            return Err(WorkDirError::NotADirectory(self.path.clone()));
        }
        let mode = meta.mode() & 0o7777;
        if mode != WORK_DIR_MODE {
            return Err(WorkDirError::BadMode {
                path: self.path.clone(),
                found: mode,
                expected: WORK_DIR_MODE,
            });
        }
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        if meta.uid() != uid || meta.gid() != gid {
            return Err(WorkDirError::BadOwner {
                path: self.path.clone(),
                uid: meta.uid(),
                gid: meta.gid(),
            });
        }
        Ok(())
    }

    /// Create the directory with the fixed mode, or verify an existing one
    /// and remove everything inside it. Idempotent reset.
    pub fn initialize(&self) -> Result<()> {
        if !self.path.exists() {
            fs::DirBuilder::new()
                .mode(WORK_DIR_MODE)
                .create(&self.path)
                .with_context(|| {
                    format!("creating work directory '{}'", self.path.display())
                })?;
        } else {
            self.verify()?;
            truncate_dir(&self.path).with_context(|| {
                format!("resetting work directory '{}'", self.path.display())
            })?;
        }
        Ok(())
    }

    pub fn has_current(&self) -> bool {
        self.current_path().symlink_metadata().is_ok()
    }

    /// Path of the open chroot directory.
    pub fn current_dir_path(&self) -> Result<PathBuf, WorkDirError> {
        let cur = self.current_path();
        if cur.symlink_metadata().is_err() {
            return Err(WorkDirError::NoCurrent(self.path.clone()));
        }
        Ok(cur)
    }

    /// Open a chroot directory, either fresh or from a sealed checkpoint.
    ///
    /// Fails if a current directory already exists; an action that died
    /// mid-flight must be explicitly discarded (or adopted) first.
    pub fn open_checkpoint(&self, from: Option<&str>) -> Result<PathBuf> {
        let cur = self.current_path();
        if cur.symlink_metadata().is_ok() {
            return Err(WorkDirError::CurrentExists(self.path.clone()).into());
        }

        match from {
            Some(name) => {
                let source = self.path.join(name);
                if !source.is_dir() || name == CURRENT_DIR_NAME {
                    return Err(WorkDirError::UnknownCheckpoint(name.to_string()).into());
                }
                match self.strategy {
                    CheckpointStrategy::Rename => {
                        fs::rename(&source, &cur).with_context(|| {
                            format!("renaming checkpoint '{name}' into place")
                        })?;
                        // Tombstone: the name stays taken even though the
                        // directory is gone.
                        fs::write(&source, b"").with_context(|| {
                            format!("writing tombstone for checkpoint '{name}'")
                        })?;
                    }
                    CheckpointStrategy::Copy => {
                        copy_dir_recursive(&source, &cur)
                            .with_context(|| format!("copying checkpoint '{name}'"))?;
                    }
                }
            }
            None => {
                fs::create_dir(&cur).with_context(|| {
                    format!("creating chroot directory '{}'", cur.display())
                })?;
            }
        }

        Ok(cur)
    }

    /// Seal the current chroot directory under a checkpoint name.
    ///
    /// The name must be unused, tombstones included; sealed checkpoints are
    /// never mutated or overwritten.
    pub fn seal_checkpoint(&self, to: &str) -> Result<()> {
        let cur = self.current_dir_path()?;
        if to == CURRENT_DIR_NAME {
            return Err(WorkDirError::ReservedName(to.to_string()).into());
        }
        let target = self.path.join(to);
        if target.symlink_metadata().is_ok() {
            return Err(WorkDirError::NameCollision(to.to_string()).into());
        }
        fs::rename(&cur, &target)
            .with_context(|| format!("sealing checkpoint '{to}'"))?;
        Ok(())
    }

    /// Throw away the current chroot directory, if any.
    pub fn discard_current(&self) -> Result<()> {
        let cur = self.current_path();
        if cur.symlink_metadata().is_ok() {
            fs::remove_dir_all(&cur).with_context(|| {
                format!("discarding chroot directory '{}'", cur.display())
            })?;
        }
        Ok(())
    }

    /// Names of all sealed checkpoints, in step order.
    pub fn list_checkpoints(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("reading work directory '{}'", self.path.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name != CURRENT_DIR_NAME {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Most recently sealed checkpoint, if any.
    pub fn latest_checkpoint(&self) -> Result<Option<String>> {
        Ok(self.list_checkpoints()?.pop())
    }

    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Apparent size of a sealed checkpoint in bytes.
    pub fn checkpoint_size(&self, name: &str) -> Result<u64> {
        let path = self.path.join(name);
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&path).follow_links(false) {
            let entry =
                entry.with_context(|| format!("walking checkpoint '{name}'"))?;
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }

    /// Write a serialized record into the work-directory root.
    pub fn save_record<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path.join(name);
        let data = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing record '{name}'"))?;
        fs::write(&path, data)
            .with_context(|| format!("writing record '{}'", path.display()))?;
        Ok(())
    }

    pub fn load_record<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.path.join(name);
        let data = fs::read(&path)
            .with_context(|| format!("reading record '{}'", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing record '{}'", path.display()))
    }

    pub fn has_record(&self, name: &str) -> bool {
        self.path.join(name).is_file()
    }

    /// Recursively remove the whole work directory. Explicit abandonment
    /// only; nothing in the pipeline calls this.
    pub fn destroy(self) -> Result<()> {
        fs::remove_dir_all(&self.path)
            .with_context(|| format!("removing work directory '{}'", self.path.display()))
    }

    fn current_path(&self) -> PathBuf {
        self.path.join(CURRENT_DIR_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn workdir(temp: &TempDir, strategy: CheckpointStrategy) -> WorkDir {
        let wd = WorkDir::new(temp.path().join("work"), strategy);
        wd.initialize().unwrap();
        wd
    }

    #[test]
    fn test_initialize_creates_with_mode() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);
        let mode = fs::metadata(wd.path()).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o700);
        assert!(wd.verify().is_ok());
    }

    #[test]
    fn test_initialize_resets_existing() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);
        fs::write(wd.path().join("leftover"), "x").unwrap();

        wd.initialize().unwrap();

        assert!(!wd.path().join("leftover").exists());
    }

    #[test]
    fn test_verify_rejects_wrong_mode() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);
        fs::set_permissions(wd.path(), fs::Permissions::from_mode(0o755)).unwrap();

        match wd.verify() {
            Err(WorkDirError::BadMode { found, .. }) => assert_eq!(found, 0o755),
            other => panic!("expected BadMode, got {other:?}"),
        }
    }

    #[test]
    fn test_verify_rejects_missing_directory() {
        let temp = TempDir::new().unwrap();
        let wd = WorkDir::new(temp.path().join("nope"), CheckpointStrategy::Copy);
        assert!(matches!(wd.verify(), Err(WorkDirError::NotADirectory(_))));
    }

    #[test]
    fn test_single_current_invariant() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);

        wd.open_checkpoint(None).unwrap();
        let err = wd.open_checkpoint(None).unwrap_err();
        assert!(err.downcast_ref::<WorkDirError>().is_some());

        wd.seal_checkpoint("00-UNPACKED").unwrap();
        assert!(!wd.has_current());
        wd.open_checkpoint(Some("00-UNPACKED")).unwrap();
        assert!(wd.has_current());
    }

    #[test]
    fn test_seal_refuses_name_collision() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);

        wd.open_checkpoint(None).unwrap();
        wd.seal_checkpoint("00-UNPACKED").unwrap();
        wd.open_checkpoint(None).unwrap();
        let err = wd.seal_checkpoint("00-UNPACKED").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkDirError>(),
            Some(WorkDirError::NameCollision(_))
        ));
    }

    #[test]
    fn test_copy_strategy_preserves_sealed_checkpoint() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);

        let cur = wd.open_checkpoint(None).unwrap();
        fs::write(cur.join("etc-file"), "sealed content").unwrap();
        wd.seal_checkpoint("00-UNPACKED").unwrap();

        let cur = wd.open_checkpoint(Some("00-UNPACKED")).unwrap();
        fs::write(cur.join("scratch"), "mutation").unwrap();

        // The sealed copy never sees the mutation.
        let sealed = wd.checkpoint_path("00-UNPACKED");
        assert!(sealed.join("etc-file").exists());
        assert!(!sealed.join("scratch").exists());
    }

    #[test]
    fn test_rename_strategy_leaves_tombstone() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Rename);

        wd.open_checkpoint(None).unwrap();
        wd.seal_checkpoint("00-UNPACKED").unwrap();
        wd.open_checkpoint(Some("00-UNPACKED")).unwrap();

        // The name remains taken by a file, so it is no longer listed as a
        // checkpoint and can never be re-sealed.
        assert!(wd.checkpoint_path("00-UNPACKED").is_file());
        assert!(wd.list_checkpoints().unwrap().is_empty());
        let err = wd.seal_checkpoint("00-UNPACKED").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkDirError>(),
            Some(WorkDirError::NameCollision(_))
        ));
    }

    #[test]
    fn test_open_unknown_checkpoint_fails() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);
        let err = wd.open_checkpoint(Some("03-MISSING")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkDirError>(),
            Some(WorkDirError::UnknownCheckpoint(_))
        ));
    }

    #[test]
    fn test_list_checkpoints_ignores_records_and_cur() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);

        wd.save_record("progress.json", &serde_json::json!({"step": "INIT"}))
            .unwrap();
        wd.open_checkpoint(None).unwrap();
        wd.seal_checkpoint("00-UNPACKED").unwrap();
        wd.open_checkpoint(Some("00-UNPACKED")).unwrap();
        wd.seal_checkpoint("01-REPOSITORIES_READY").unwrap();

        assert_eq!(
            wd.list_checkpoints().unwrap(),
            vec!["00-UNPACKED".to_string(), "01-REPOSITORIES_READY".to_string()]
        );
        assert_eq!(
            wd.latest_checkpoint().unwrap().as_deref(),
            Some("01-REPOSITORIES_READY")
        );
    }

    #[test]
    fn test_checkpoint_size() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);

        let cur = wd.open_checkpoint(None).unwrap();
        fs::write(cur.join("a"), [0u8; 100]).unwrap();
        fs::create_dir(cur.join("dir")).unwrap();
        fs::write(cur.join("dir/b"), [0u8; 24]).unwrap();
        wd.seal_checkpoint("00-UNPACKED").unwrap();

        assert_eq!(wd.checkpoint_size("00-UNPACKED").unwrap(), 124);
    }

    #[test]
    fn test_discard_current() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);

        wd.open_checkpoint(None).unwrap();
        wd.discard_current().unwrap();
        assert!(!wd.has_current());
        // Idempotent.
        wd.discard_current().unwrap();
    }

    #[test]
    fn test_records_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Rec {
            value: u32,
        }

        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);
        wd.save_record("rec.json", &Rec { value: 7 }).unwrap();
        assert!(wd.has_record("rec.json"));
        let loaded: Rec = wd.load_record("rec.json").unwrap();
        assert_eq!(loaded, Rec { value: 7 });
    }

    #[test]
    fn test_destroy() {
        let temp = TempDir::new().unwrap();
        let wd = workdir(&temp, CheckpointStrategy::Copy);
        let path = wd.path().to_path_buf();
        wd.destroy().unwrap();
        assert!(!path.exists());
    }
}
