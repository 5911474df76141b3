//! Seed stages: the archive unpacked to create the first checkpoint.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha512};

use crate::process::Cmd;

/// Source of the base filesystem tree for a fresh build.
pub trait SeedStage {
    /// Hex digest identifying the seed, recorded for diagnostics.
    fn digest(&self) -> Result<String>;

    /// Populate `target_dir` with the base tree.
    fn unpack(&self, target_dir: &Path) -> Result<()>;
}

/// A Gentoo stage-3 tarball, optionally accompanied by an upstream digest
/// file (`<archive>.DIGESTS`).
pub struct Stage3Archive {
    path: PathBuf,
    digest_path: PathBuf,
}

impl Stage3Archive {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            bail!("seed archive '{}' not found", path.display());
        }
        let digest_path = PathBuf::from(format!("{}.DIGESTS", path.display()));
        Ok(Self { path, digest_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SeedStage for Stage3Archive {
    fn digest(&self) -> Result<String> {
        if self.digest_path.is_file() {
            let text = fs::read_to_string(&self.digest_path).with_context(|| {
                format!("reading digest file '{}'", self.digest_path.display())
            })?;
            return Ok(text.trim().to_string());
        }
        sha512_file(&self.path)
    }

    fn unpack(&self, target_dir: &Path) -> Result<()> {
        unpack_tarball(&self.path, target_dir)
            .with_context(|| format!("unpacking seed archive '{}'", self.path.display()))
    }
}

/// Unpack a tarball into a directory, preserving permissions.
///
/// `.tar` and `.tar.zst` are handled natively; other compressions go
/// through the host `tar`, which dispatches on the suffix itself.
pub fn unpack_tarball(archive: &Path, dest: &Path) -> Result<()> {
    if !archive.is_file() {
        bail!("archive '{}' not found", archive.display());
    }
    fs::create_dir_all(dest)
        .with_context(|| format!("creating destination '{}'", dest.display()))?;

    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if name.ends_with(".tar") {
        let file = File::open(archive)
            .with_context(|| format!("opening '{}'", archive.display()))?;
        unpack_archive(tar::Archive::new(file), archive, dest)
    } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        let file = File::open(archive)
            .with_context(|| format!("opening '{}'", archive.display()))?;
        let decoder = zstd::stream::Decoder::new(file)
            .with_context(|| format!("reading zstd stream from '{}'", archive.display()))?;
        unpack_archive(tar::Archive::new(decoder), archive, dest)
    } else {
        Cmd::new("tar")
            .args(&["-xpf"])
            .arg_path(archive)
            .args(&["-C"])
            .arg_path(dest)
            .error_msg("host tar is required for xz/bzip2/gzip seed archives")
            .run()?;
        Ok(())
    }
}

fn unpack_archive<R: Read>(mut archive: tar::Archive<R>, source: &Path, dest: &Path) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .with_context(|| format!("unpacking '{}'", source.display()))
}

/// Streaming sha512 of a file, as a lowercase hex string.
pub fn sha512_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha512::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_tarball(temp: &TempDir) -> PathBuf {
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("etc")).unwrap();
        fs::write(tree.join("etc/hostname"), "stage\n").unwrap();

        let archive_path = temp.path().join("seed.tar");
        let file = File::create(&archive_path).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", &tree).unwrap();
        builder.finish().unwrap();
        archive_path
    }

    #[test]
    fn test_unpack_plain_tar() {
        let temp = TempDir::new().unwrap();
        let archive = make_tarball(&temp);
        let dest = temp.path().join("out");

        unpack_tarball(&archive, &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("etc/hostname")).unwrap(),
            "stage\n"
        );
    }

    #[test]
    fn test_unpack_missing_archive_fails() {
        let temp = TempDir::new().unwrap();
        let err = unpack_tarball(&temp.path().join("nope.tar"), &temp.path().join("out"))
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_stage3_digest_prefers_digest_file() {
        let temp = TempDir::new().unwrap();
        let archive = make_tarball(&temp);
        fs::write(
            temp.path().join("seed.tar.DIGESTS"),
            "deadbeef  seed.tar\n",
        )
        .unwrap();

        let seed = Stage3Archive::open(&archive).unwrap();
        assert_eq!(seed.digest().unwrap(), "deadbeef  seed.tar");
    }

    #[test]
    fn test_stage3_digest_falls_back_to_sha512() {
        let temp = TempDir::new().unwrap();
        let archive = make_tarball(&temp);

        let seed = Stage3Archive::open(&archive).unwrap();
        let digest = seed.digest().unwrap();
        assert_eq!(digest.len(), 128);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_stage3_open_requires_file() {
        let temp = TempDir::new().unwrap();
        assert!(Stage3Archive::open(temp.path().join("missing.tar.xz")).is_err());
    }

    #[test]
    fn test_seed_stage_unpacks_into_checkpoint_dir() {
        let temp = TempDir::new().unwrap();
        let archive = make_tarball(&temp);
        let seed = Stage3Archive::open(&archive).unwrap();

        let dest = temp.path().join("cur");
        fs::create_dir(&dest).unwrap();
        seed.unpack(&dest).unwrap();
        assert!(dest.join("etc/hostname").is_file());
    }
}
