//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::Write;
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};

use crate::QuotedArg;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process; on failure the error includes the
    /// last part of stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process, writing the provided buffer to its
    /// standard input and then closing it.
    fn run_with_input(&mut self, input: &[u8]) -> Result<Output>;

    /// Execute the child process and parse its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;

    /// Execute the child process and return stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Render the command as a shell-quoted string, for presenting to a user.
    fn to_string_pretty(&self) -> String;
}

/// Keep only the tail of possibly large child error output.
const MAX_STDERR_BYTES: usize = 1024;

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Convert a completed child into an error if it failed.
fn check_output(cmd: &Command, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let prog = cmd.get_program().to_string_lossy();
    let stderr = stderr_tail(&output.stderr);
    if stderr.is_empty() {
        anyhow::bail!("{prog} failed: {}", output.status)
    } else {
        anyhow::bail!("{prog} failed: {}: {stderr}", output.status)
    }
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run(&mut self) -> Result<()> {
        let st = self
            .status()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        if !st.success() {
            anyhow::bail!("{:?} failed: {st}", self.get_program());
        }
        Ok(())
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let output = self
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        check_output(self, &output)
    }

    fn run_with_input(&mut self, input: &[u8]) -> Result<Output> {
        let mut child = self
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).context("Writing child stdin")?;
            // Dropping closes the pipe so the child sees EOF
        }
        child.wait_with_output().context("Waiting for child")
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let output = self
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        check_output(self, &output)?;
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Parsing JSON from {:?}", self.get_program()))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let output = self
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        check_output(self, &output)?;
        String::from_utf8(output.stdout)
            .with_context(|| format!("Decoding output of {:?}", self.get_program()))
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| QuotedArg::new(arg).to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
