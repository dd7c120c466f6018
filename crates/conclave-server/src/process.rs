//! Uniform subprocess gateway.
//!
//! External helpers (signing-ticket validator, store sync, workspace
//! delete, mail sender, screen-share reflector) all go through this
//! wrapper: stdout/stderr captured up to a cap, a wall-clock timeout, and
//! one uniform outcome (exited, signaled, timed out).

use std::{path::Path, process::Stdio, time::Duration};

use tokio::{io::AsyncWriteExt, process::Command};

use crate::error::ServerError;

/// Captured output is truncated to this many bytes per stream.
const OUTPUT_CAP: usize = 64 * 1024;

/// How a helper process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEnd {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled,
    /// Ran past its timeout and was killed.
    TimedOut,
}

/// Outcome of a helper invocation.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// How the process ended
    pub end: ProcessEnd,
    /// Captured stdout, truncated to the cap
    pub stdout: Vec<u8>,
    /// Captured stderr, truncated to the cap
    pub stderr: Vec<u8>,
}

impl ProcessOutcome {
    /// True if the process exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.end == ProcessEnd::Exited(0)
    }
}

/// Run a helper to completion.
///
/// `stdin_data`, when present, is written to the child's stdin which is
/// then closed. The child is killed on timeout or drop.
pub async fn run_helper(
    program: &Path,
    args: &[&str],
    stdin_data: Option<&[u8]>,
    timeout: Duration,
) -> Result<ProcessOutcome, ServerError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin_data.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }
    }

    let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;

    match waited {
        Ok(output) => {
            let output = output?;
            let mut stdout = output.stdout;
            stdout.truncate(OUTPUT_CAP);
            let mut stderr = output.stderr;
            stderr.truncate(OUTPUT_CAP);

            let end = match output.status.code() {
                Some(code) => ProcessEnd::Exited(code),
                None => ProcessEnd::Signaled,
            };
            Ok(ProcessOutcome { end, stdout, stderr })
        },
        Err(_) => {
            // wait_with_output consumed the child; kill_on_drop reaps it.
            Ok(ProcessOutcome { end: ProcessEnd::TimedOut, stdout: Vec::new(), stderr: Vec::new() })
        },
    }
}

/// Log a helper's captured output at debug level.
pub fn log_output(name: &str, outcome: &ProcessOutcome) {
    if !outcome.stdout.is_empty() {
        tracing::debug!(helper = name, "stdout: {}", String::from_utf8_lossy(&outcome.stdout));
    }
    if !outcome.stderr.is_empty() {
        tracing::debug!(helper = name, "stderr: {}", String::from_utf8_lossy(&outcome.stderr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let outcome = run_helper(
            Path::new("/bin/sh"),
            &["-c", "echo out; echo err >&2; exit 3"],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(outcome.end, ProcessEnd::Exited(3));
        assert_eq!(outcome.stdout, b"out\n");
        assert_eq!(outcome.stderr, b"err\n");
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let outcome = run_helper(
            Path::new("/bin/cat"),
            &[],
            Some(b"hello"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout, b"hello");
    }

    #[tokio::test]
    async fn times_out_runaway_helper() {
        let outcome = run_helper(
            Path::new("/bin/sleep"),
            &["30"],
            None,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(outcome.end, ProcessEnd::TimedOut);
    }
}
