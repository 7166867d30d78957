//! Helpers for running package managers, lifecycle scripts and
//! other host tools via [`std::process::Command`].

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::{
    io::{Read, Seek},
    process::Command,
};

use anyhow::{Context, Result};

use crate::errors::VzttError;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process; on failure the error is a
    /// [`VzttError::Backend`] naming `backend` and carrying the tail of stderr.
    fn run_backend(&mut self, backend: &str) -> Result<()>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;
}

/// Parse the last chunk (e.g. 1024 bytes) from the provided file,
/// ensure it's UTF-8, and return that value. This function is infallible;
/// if the file cannot be read for some reason, a copy of a static string
/// is returned.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut stderr_buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

/// Run `cmd` with stderr captured; returns the exit status and the stderr tail.
fn run_capturing(cmd: &mut Command) -> Result<(std::process::ExitStatus, String)> {
    let stderr = tempfile::tempfile()?;
    cmd.stderr(stderr.try_clone()?);
    tracing::trace!("exec: {cmd:?}");
    let status = cmd
        .status()
        .with_context(|| format!("Spawning {:?}", cmd.get_program()))?;
    Ok((status, last_utf8_content_from_file(stderr)))
}

impl CommandRunExt for Command {
    /// Synchronously execute the child, and return an error if the child exited unsuccessfully.
    fn run(&mut self) -> Result<()> {
        let (status, stderr) = run_capturing(self)?;
        if status.success() {
            return Ok(());
        }
        anyhow::bail!("Subprocess failed: {status:?}\n{stderr}")
    }

    fn run_backend(&mut self, backend: &str) -> Result<()> {
        let (status, stderr) = run_capturing(self)?;
        if status.success() {
            return Ok(());
        }
        tracing::error!("{backend} exited with {status}");
        Err(VzttError::Backend {
            backend: backend.to_string(),
            message: format!("{status}\n{}", stderr.trim_end()),
        }
        .into())
    }

    /// Output a debug-level log message with this command.
    fn log_debug(&mut self) -> &mut Self {
        // We unconditionally log at trace level, so avoid double logging
        if !tracing::enabled!(tracing::Level::TRACE) {
            tracing::debug!("exec: {self:?}");
        }
        self
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut s = String::new();
        stdout.read_to_string(&mut s).context("Reading stdout")?;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{error_code, ErrorCode};

    #[test]
    fn command_run_ext() {
        Command::new("true").run().unwrap();
        assert!(Command::new("false").run().is_err());

        let e = Command::new("/bin/sh")
            .args(["-c", "echo expected-this-oops-message 1>&2; exit 1"])
            .run()
            .err()
            .unwrap();
        similar_asserts::assert_eq!(
            e.to_string(),
            "Subprocess failed: ExitStatus(unix_wait_status(256))\nexpected-this-oops-message\n"
        );
    }

    #[test]
    fn backend_failure_is_typed() {
        let e = Command::new("/bin/sh")
            .args(["-c", "echo 'No package nosuchpkg available.' 1>&2; exit 1"])
            .run_backend("yum")
            .unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::Backend);
        assert!(e.to_string().contains("No package nosuchpkg available."));
    }

    #[test]
    fn capture_stdout() {
        let s = Command::new("echo").arg("bash x86_64").run_get_string().unwrap();
        assert_eq!(s, "bash x86_64\n");
    }
}
