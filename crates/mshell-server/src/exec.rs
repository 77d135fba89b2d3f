//! The external shell executor.
//!
//! Runs one line through `sh -c` in a given working directory with a
//! deadline. Failures never escalate: whatever happened is rendered into
//! the output string so the remote user sees it verbatim.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Execute `command` in `cwd`, returning combined stdout + stderr.
pub async fn run_shell(command: &str, cwd: &Path, timeout: Duration) -> String {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => return format!("error: {e}\n"),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => {
            debug!(command, "command timed out");
            "error: Timeout\n".to_string()
        }
        Ok(Err(e)) => format!("error: {e}\n"),
        Ok(Ok(output)) => {
            let mut out = String::from_utf8_lossy(&output.stdout).into_owned();
            out.push_str(&String::from_utf8_lossy(&output.stderr));
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_shell("echo hi", Path::new("/"), Duration::from_secs(5)).await;
        assert_eq!(out, "hi\n");
    }

    #[tokio::test]
    async fn captures_stderr_after_stdout() {
        let out = run_shell(
            "echo out; echo err >&2",
            Path::new("/"),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(out, "out\nerr\n");
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell("pwd", dir.path(), Duration::from_secs(5)).await;
        assert_eq!(out.trim_end(), dir.path().to_str().unwrap());
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let out = run_shell("sleep 5", Path::new("/"), Duration::from_millis(100)).await;
        assert!(out.contains("Timeout"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_user_output() {
        let out = run_shell("ls /definitely-missing-dir", Path::new("/"), Duration::from_secs(5)).await;
        assert!(!out.is_empty());
    }
}
