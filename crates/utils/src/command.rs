//! Helpers intended for [`std::process::Command`] and [`tokio::process::Command`].

use std::future::Future;
use std::process::{Command, ExitStatus, Output};

use anyhow::{Context, Result};

/// Render a program and its arguments the way a POSIX shell would parse them.
fn render_argv<'a>(argv: impl IntoIterator<Item = &'a std::ffi::OsStr>) -> String {
    let argv: Vec<_> = argv
        .into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    shlex::try_join(argv.iter().map(|s| s.as_str())).unwrap_or_else(|_| argv.join(" "))
}

/// Turn a failed process exit into an error carrying the command and its stderr.
fn check_output(desc: &str, status: ExitStatus, stderr: &[u8]) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        anyhow::bail!("Subprocess failed: {desc}: {status}")
    } else {
        anyhow::bail!("Subprocess failed: {desc}: {status}: {stderr}")
    }
}

/// Extension trait for [`Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, inheriting stdio.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process; on failure the captured stderr is
    /// included in the error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// The command as a shell-quoted string, suitable for humans.
    fn to_string_pretty(&self) -> String;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run(&mut self) -> Result<()> {
        let desc = self.to_string_pretty();
        let status = self
            .status()
            .with_context(|| format!("Spawning {desc}"))?;
        check_output(&desc, status, &[])
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let desc = self.to_string_pretty();
        let Output { status, stderr, .. } = self
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .output()
            .with_context(|| format!("Spawning {desc}"))?;
        check_output(&desc, status, &stderr)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let desc = self.to_string_pretty();
        let Output {
            status,
            stdout,
            stderr,
        } = self
            .stdin(std::process::Stdio::null())
            .output()
            .with_context(|| format!("Spawning {desc}"))?;
        check_output(&desc, status, &stderr)?;
        String::from_utf8(stdout).with_context(|| format!("Decoding output of {desc}"))
    }

    fn to_string_pretty(&self) -> String {
        render_argv(std::iter::once(self.get_program()).chain(self.get_args()))
    }
}

/// Asynchronous counterpart of [`CommandRunExt`] for [`tokio::process::Command`].
///
/// Children are killed if the returned future is dropped before completion,
/// which is what makes a pending mount preemptible.
pub trait AsyncCommandRunExt {
    /// Execute the child process, capturing stderr for the error message.
    fn run(&mut self) -> impl Future<Output = Result<()>> + Send;
}

impl AsyncCommandRunExt for tokio::process::Command {
    fn run(&mut self) -> impl Future<Output = Result<()>> + Send {
        let std = self.as_std();
        let desc = render_argv(std::iter::once(std.get_program()).chain(std.get_args()));
        tracing::debug!("exec: {desc}");
        let child = self
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        async move {
            let child = child.with_context(|| format!("Spawning {desc}"))?;
            let Output { status, stderr, .. } = child
                .wait_with_output()
                .await
                .with_context(|| format!("Waiting for {desc}"))?;
            check_output(&desc, status, &stderr)
        }
    }
}
