//! Subprocess execution for tool entrypoints
//!
//! Contract with the tool: the JSON invocation body arrives on stdin, the
//! result is whatever the process writes to stdout. Credentials and tool
//! variables travel in the environment.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PocketError, Result};

/// Run `command` through `sh -c` in `cwd`, feeding `body` on stdin.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    envs: &HashMap<String, String>,
    body: &str,
) -> Result<String> {
    debug!(%command, cwd = %cwd.display(), "spawning tool process");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(envs)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PocketError::Runtime(format!("failed to spawn `{}`: {}", command, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(body.as_bytes()).await?;
        // Drop closes the pipe so tools reading to EOF can proceed.
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PocketError::Runtime(format!(
            "tool process exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .trim_end()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdout_is_captured() {
        let out = run_shell("printf hello", Path::new("."), &HashMap::new(), "")
            .await
            .expect("run");
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn stdin_reaches_the_process() {
        let out = run_shell("cat", Path::new("."), &HashMap::new(), r#"{"a":1}"#)
            .await
            .expect("run");
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn envs_are_injected() {
        let envs = [("POCKET_TEST_VAR".to_string(), "42".to_string())].into();
        let out = run_shell("printf '%s' \"$POCKET_TEST_VAR\"", Path::new("."), &envs, "")
            .await
            .expect("run");
        assert_eq!(out, "42");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let err = run_shell("exit 3", Path::new("."), &HashMap::new(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, PocketError::Runtime(_)));
    }
}
