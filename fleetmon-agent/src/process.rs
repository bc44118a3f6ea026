//! Bounded execution of external processes
//!
//! Every child process the agent starts goes through here so that:
//! - No probe or script can hang the agent (hard timeout, child killed)
//! - No console window flashes on Windows hosts

use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Timeout for short hardware/OS probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a completed child process.
#[derive(Debug)]
pub struct ProcessOutput {
    /// Stdout, with stderr appended under a marker when present.
    pub output: String,
    pub exit_code: Option<i32>,
}

fn build_command(program: &str, args: &[&str]) -> AsyncCommand {
    let mut cmd = AsyncCommand::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // The child must not outlive a timed-out or dropped future.
        .kill_on_drop(true);

    #[cfg(windows)]
    {
        use winapi::um::winbase::CREATE_NO_WINDOW;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd
}

/// Run a short probe and return its stdout.
///
/// Fails on timeout, spawn error or non-zero exit. Stderr is kept out of
/// the return value so callers can parse the output line by line.
pub async fn run_probe(program: &str, args: &[&str]) -> Result<String> {
    debug!("Running probe: {} {:?}", program, args);

    let output = tokio::time::timeout(PROBE_TIMEOUT, build_command(program, args).output())
        .await
        .with_context(|| format!("{} timed out", program))?
        .with_context(|| format!("Failed to execute {}", program))?;

    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with status {}: {}",
            program,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run a process to completion under a hard timeout.
///
/// A non-zero exit is reported through `exit_code`, not as an error, so
/// callers can forward the captured output either way.
pub async fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<ProcessOutput> {
    debug!("Running: {} {:?} (timeout: {:?})", program, args, timeout);

    let output = tokio::time::timeout(timeout, build_command(program, args).output())
        .await
        .with_context(|| format!("{} timed out after {}s", program, timeout.as_secs()))?
        .with_context(|| format!("Failed to execute {}", program))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{}\nSTDERR:\n{}", stdout, stderr)
    };

    Ok(ProcessOutput {
        output: combined,
        exit_code: output.status.code(),
    })
}

/// Run a process that is expected to succeed, returning its output.
pub async fn run_checked(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let result = run_with_timeout(program, args, timeout).await?;

    match result.exit_code {
        Some(0) => Ok(result.output),
        code => Err(anyhow!(
            "{} exited with status {}: {}",
            program,
            code.unwrap_or(-1),
            result.output.trim()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_captures_stdout() {
        let output = if cfg!(target_os = "windows") {
            run_probe("cmd", &["/C", "echo hello"]).await.unwrap()
        } else {
            run_probe("echo", &["hello"]).await.unwrap()
        };

        assert!(output.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_raised() {
        let result = run_with_timeout("sh", &["-c", "echo out; echo err >&2; exit 3"], PROBE_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(result.output.contains("out"));
        assert!(result.output.contains("STDERR:"));
        assert!(result.output.contains("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_and_errors() {
        let err = run_with_timeout("sleep", &["30"], Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_checked_run_rejects_failure() {
        let err = run_checked("sh", &["-c", "exit 1"], PROBE_TIMEOUT)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("exited with status 1"));
    }
}
