//! Thin subprocess wrapper used for all external tool invocations.
//!
//! `Cmd` builds a `std::process::Command`, captures output by default and
//! folds a non-zero exit into an error message carrying the trimmed
//! stdout/stderr. `run_interactive` inherits the parent's stdio for
//! long-running tools whose progress output should reach the terminal.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

/// Check whether a command is available on the host PATH.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder for a single external command invocation.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    allow_fail: bool,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            allow_fail: false,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(OsString::from(arg));
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(OsString::from));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    /// A non-zero exit becomes a normal `CmdOutput` instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Extra context appended to the failure message (install hints etc.).
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Run with captured stdout/stderr.
    pub fn run(self) -> Result<CmdOutput> {
        let rendered = self.rendered();
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let output = command
            .output()
            .with_context(|| format!("running `{rendered}`"))?;
        let result = CmdOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let mut msg = format!(
                "`{rendered}` failed ({}): {}\n{}",
                result.status,
                result.stdout.trim(),
                result.stderr.trim()
            );
            if let Some(extra) = &self.error_msg {
                msg.push('\n');
                msg.push_str(extra);
            }
            bail!(msg);
        }

        Ok(result)
    }

    /// Run with inherited stdio; only the exit status is checked.
    pub fn run_interactive(self) -> Result<()> {
        let rendered = self.rendered();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let status = command
            .status()
            .with_context(|| format!("running `{rendered}`"))?;
        if !status.success() && !self.allow_fail {
            match &self.error_msg {
                Some(extra) => bail!("`{rendered}` failed ({status})\n{extra}"),
                None => bail!("`{rendered}` failed ({status})"),
            }
        }

        Ok(())
    }

    fn rendered(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_failure_is_an_error() {
        let result = Cmd::new("false").run();
        assert!(result.is_err());
    }

    #[test]
    fn test_allow_fail_returns_output() {
        let out = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!out.success());
    }

    #[test]
    fn test_error_msg_is_appended() {
        let err = Cmd::new("false").error_msg("install hint").run().unwrap_err();
        assert!(err.to_string().contains("install hint"));
    }

    #[test]
    fn test_exists() {
        assert!(exists("ls"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }
}
