//! Containerized tool execution over the `docker` CLI

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PocketError, Result};

/// Runs container tools, pulling each image at most once per process
#[derive(Default)]
pub struct ContainerRuntime {
    pulled: Mutex<HashSet<String>>,
}

impl ContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull `image` unless this process already did. The lock is held across
    /// the pull so concurrent invocations of the same image wait instead of
    /// pulling twice.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        let mut pulled = self.pulled.lock().await;
        if pulled.contains(image) {
            return Ok(());
        }
        info!(%image, "pulling container image");
        let output = Command::new("docker")
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PocketError::Runtime(format!(
                "docker pull {} failed: {}",
                image,
                stderr.trim()
            )));
        }
        pulled.insert(image.to_string());
        Ok(())
    }

    /// Run one invocation in a throwaway container. The tool directory is
    /// mounted read-only at `/tool`, which is also the working directory.
    pub async fn run(
        &self,
        image: &str,
        entrypoint: Option<&str>,
        tool_dir: &Path,
        envs: &HashMap<String, String>,
        body: &str,
    ) -> Result<String> {
        self.ensure_image(image).await?;

        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "-i", "-w", "/tool"]);
        cmd.arg("-v")
            .arg(format!("{}:/tool:ro", tool_dir.display()));
        for (key, value) in envs {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        cmd.arg(image);
        if let Some(entrypoint) = entrypoint {
            cmd.args(["sh", "-c", entrypoint]);
        }
        debug!(%image, "running container tool");

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PocketError::Runtime(format!("failed to run docker: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PocketError::Runtime(format!(
                "container tool exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pulled_set_starts_empty() {
        let runtime = ContainerRuntime::new();
        assert!(runtime.pulled.lock().await.is_empty());
    }
}
