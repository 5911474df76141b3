//! Scripts executed inside the chroot.
//!
//! A script supplies its own payload: `fill_script_dir` materializes the
//! script file plus any data files it needs into a throwaway directory under
//! the chroot's /tmp, and `script_name` names the entry point relative to
//! that directory.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub trait ScriptInChroot {
    /// Write the script and its auxiliary files into `script_dir`.
    fn fill_script_dir(&self, script_dir: &Path) -> Result<()>;

    /// Entry-point filename inside the script directory.
    fn script_name(&self) -> &str;

    fn description(&self) -> &str;
}

/// A shell script held in memory.
pub struct ScriptFromBuffer {
    description: String,
    content: String,
}

impl ScriptFromBuffer {
    pub fn new(description: &str, content: &str) -> Self {
        Self {
            description: description.to_string(),
            content: format!("{}\n", content.trim_matches('\n')),
        }
    }
}

impl ScriptInChroot for ScriptFromBuffer {
    fn fill_script_dir(&self, script_dir: &Path) -> Result<()> {
        let path = script_dir.join(self.script_name());
        fs::write(&path, &self.content)
            .with_context(|| format!("writing script '{}'", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    fn script_name(&self) -> &str {
        "main.sh"
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// A script file taken from the host filesystem.
pub struct ScriptFromHostFile {
    description: String,
    source: PathBuf,
    name: String,
}

impl ScriptFromHostFile {
    pub fn new(description: &str, source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
            bail!("script path '{}' has no usable filename", source.display());
        };
        Ok(Self {
            description: description.to_string(),
            name: name.to_string(),
            source,
        })
    }
}

impl ScriptInChroot for ScriptFromHostFile {
    fn fill_script_dir(&self, script_dir: &Path) -> Result<()> {
        let dest = script_dir.join(&self.name);
        fs::copy(&self.source, &dest).with_context(|| {
            format!(
                "copying script '{}' to '{}'",
                self.source.display(),
                dest.display()
            )
        })?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    fn script_name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_buffer_script_materializes_executable() {
        let temp = TempDir::new().unwrap();
        let script = ScriptFromBuffer::new("say hello", "#!/bin/sh\necho hello\n\n\n");
        script.fill_script_dir(temp.path()).unwrap();

        let path = temp.path().join("main.sh");
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("echo hello\n"));
        assert!(!content.ends_with("\n\n"));
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o755);
    }

    #[test]
    fn test_host_file_script_keeps_its_name() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("provision.sh");
        fs::write(&source, "#!/bin/sh\ntrue\n").unwrap();

        let script = ScriptFromHostFile::new("provision", &source).unwrap();
        assert_eq!(script.script_name(), "provision.sh");

        let dir = temp.path().join("dir");
        fs::create_dir(&dir).unwrap();
        script.fill_script_dir(&dir).unwrap();
        assert_eq!(fs::metadata(dir.join("provision.sh")).unwrap().mode() & 0o777, 0o755);
    }

    #[test]
    fn test_host_file_script_rejects_bad_path() {
        assert!(ScriptFromHostFile::new("bad", "/").is_err());
    }
}
