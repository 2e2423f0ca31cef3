//! Asynchronous utilities for use with Tokio.
//!
//! This is where we keep the small amount of async plumbing shared by the
//! engines and the pipeline: boxed future/stream aliases, a way to run
//! blocking filesystem work off the executor, and helpers for external
//! commands.

use std::{pin::Pin, sync::LazyLock};

use futures::Stream;
use regex::Regex;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // Blocking tasks are only cancelled when the runtime shuts down.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

/// Build a command for an external engine.
///
/// The child is killed if the future waiting on it is dropped, so a page
/// that times out doesn't leave the engine running in the background.
pub fn engine_command(program: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.kill_on_drop(true);
    cmd
}

/// A default error regex for checking command output.
pub static DEFAULT_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. Standard error may optionally be checked with
/// `is_error_line`, to catch tools that exit successfully after printing
/// errors.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    /// Is the process gone (or only waiting to be reaped)?
    #[cfg(target_os = "linux")]
    fn process_is_dead(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[tokio::test]
    #[cfg(target_os = "linux")]
    async fn timed_out_engine_commands_are_killed() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pid_path = dir.path().join("pid");
        let mut cmd = engine_command("sh");
        cmd.arg("-c")
            .arg(format!("echo $$ > '{}'; exec sleep 60", pid_path.display()));

        let waited =
            tokio::time::timeout(std::time::Duration::from_secs(1), cmd.output()).await;
        assert!(waited.is_err(), "sleep should have timed out");

        let pid = std::fs::read_to_string(&pid_path)?.trim().to_owned();
        let mut dead = false;
        for _ in 0..50 {
            if process_is_dead(&pid) {
                dead = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(dead, "process {pid} outlived its timeout");
        Ok(())
    }

    #[test]
    fn default_error_regex_is_case_insensitive() {
        assert!(DEFAULT_ERROR_REGEX.is_match("Error: bad page"));
        assert!(DEFAULT_ERROR_REGEX.is_match("syntax ERROR"));
        assert!(!DEFAULT_ERROR_REGEX.is_match("warning: odd font"));
    }

    #[test]
    #[cfg(unix)]
    fn command_failure_is_reported_with_stderr() {
        let output = Command::new("sh")
            .arg("-c")
            .arg("echo 'it broke' >&2; exit 3")
            .output()
            .unwrap();
        let err = check_for_command_failure("sh", &output, None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("it broke"), "{msg}");
    }

    #[test]
    #[cfg(unix)]
    fn error_lines_fail_successful_commands() {
        let output = Command::new("sh")
            .arg("-c")
            .arg("echo 'Error: xref table damaged' >&2")
            .output()
            .unwrap();
        let is_error = |line: &str| DEFAULT_ERROR_REGEX.is_match(line);
        assert!(check_for_command_failure("sh", &output, Some(&is_error)).is_err());
        assert!(check_for_command_failure("sh", &output, None).is_ok());
    }
}
