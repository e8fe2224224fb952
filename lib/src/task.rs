//! Thin wrapper around `std::process::Command` for the helper binaries the
//! design notes keep external (`mkfs.xfs`, the setuid `mount` helper,
//! `dd`). Adapted from the teacher's own shell-out helper.

use std::ffi::OsStr;
use std::process::{Command, Stdio};

use crate::error::CoreError;

pub(crate) struct Task {
    description: String,
    quiet: bool,
    cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<OsStr>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        cmd.stdin(Stdio::null());
        Self {
            description: description.as_ref().to_string(),
            quiet: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Run the command; fail with [`CoreError::HelperProcess`] if it does
    /// not exit successfully.
    pub(crate) fn run(mut self) -> Result<(), CoreError> {
        if !self.quiet {
            tracing::debug!("{}", self.description);
        }
        tracing::trace!(cmd = ?self.cmd, "exec");
        let program = self.cmd.get_program().to_string_lossy().into_owned();
        let status = self.cmd.status().map_err(|e| CoreError::HelperProcess {
            program: program.clone(),
            detail: format!("spawn failed: {e}"),
        })?;
        if !status.success() {
            return Err(CoreError::HelperProcess {
                program,
                detail: format!("exited with {status:?}"),
            });
        }
        Ok(())
    }

    pub(crate) fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<str>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), CoreError> {
        Self::new(description, exe.as_ref()).args(args).run()
    }
}
