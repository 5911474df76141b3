//! Filesystem helpers shared by the work directory and chroot session.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Recursively copy a directory tree, preserving symlinks and file modes.
///
/// Used by the copy checkpoint strategy; the destination is created if
/// absent and existing entries are overwritten.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("creating directory '{}'", dst.display()))?;
        let mode = fs::metadata(src)?.permissions();
        fs::set_permissions(dst, mode)
            .with_context(|| format!("setting permissions on '{}'", dst.display()))?;
    }

    for entry in
        fs::read_dir(src).with_context(|| format!("reading directory '{}'", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)
                .with_context(|| format!("reading symlink '{}'", src_path.display()))?;
            if dst_path.symlink_metadata().is_ok() {
                remove_any(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("creating symlink '{}'", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!(
                    "copying '{}' to '{}'",
                    src_path.display(),
                    dst_path.display()
                )
            })?;
        }
    }

    Ok(())
}

/// Remove every entry inside a directory, keeping the directory itself.
pub fn truncate_dir(path: &Path) -> Result<()> {
    for entry in
        fs::read_dir(path).with_context(|| format!("reading directory '{}'", path.display()))?
    {
        let entry = entry?;
        remove_any(&entry.path())?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("reading metadata for '{}'", path.display()))?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("removing directory '{}'", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("removing '{}'", path.display()))
    }
}

/// Whether `path` is currently a mount point.
///
/// Reads `/proc/self/mounts` rather than comparing device numbers: a bind
/// mount of a directory on the same filesystem keeps the device number of
/// its source and would be invisible to a `st_dev` check.
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    let canonical = match path.canonicalize() {
        Ok(p) => p,
        Err(_) => return Ok(false),
    };

    let mounts = fs::read_to_string("/proc/self/mounts")?;
    for line in mounts.lines() {
        let Some(raw) = line.split_whitespace().nth(1) else {
            continue;
        };
        if PathBuf::from(unescape_mount_path(raw)) == canonical {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Undo the octal escaping applied to mount table entries
/// (`\040` space, `\011` tab, `\012` newline, `\134` backslash).
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = &raw[i + 1..i + 4];
            if octal.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
                if let Ok(value) = u8::from_str_radix(octal, 8) {
                    out.push(value as char);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}
