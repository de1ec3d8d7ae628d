//! The lockfile: every tool package source the runtime knows about

use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::git::GitClient;
use super::lock::Lock;
use crate::error::{PocketError, Result};

/// Cap on concurrent syncs regardless of lock count
const MAX_SYNC_CONCURRENCY: usize = 100;

/// Ordered set of locks, persisted as one tab-delimited line per source
#[derive(Debug, Default)]
pub struct Lockfile {
    path: PathBuf,
    locks: BTreeMap<String, Lock>,
}

impl Lockfile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            locks: BTreeMap::new(),
        }
    }

    /// Read the lockfile at `path`; a missing file yields an empty set
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut lockfile = Self::new(&path);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(lockfile),
            Err(e) => return Err(e.into()),
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let lock = Lock::parse_line(line)?;
            lockfile.locks.insert(lock.key(), lock);
        }
        Ok(lockfile)
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut content = String::new();
        for lock in self.locks.values() {
            content.push_str(&lock.to_line());
            content.push('\n');
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    pub fn add(&mut self, lock: Lock) {
        self.locks.insert(lock.key(), lock);
    }

    pub fn remove(&mut self, key: &str) -> Option<Lock> {
        self.locks.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Lock> {
        self.locks.get(key)
    }

    pub fn locks(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Sync every source concurrently. A failing source is skipped rather
    /// than aborting the batch; all failures are reported together.
    pub async fn sync_all(&mut self, git: &GitClient, base: &Path, force: bool) -> Result<()> {
        let concurrency = std::cmp::min(self.locks.len() + 1, MAX_SYNC_CONCURRENCY);
        let locks = std::mem::take(&mut self.locks);

        let results: Vec<(String, Lock, Result<()>)> =
            futures::stream::iter(locks.into_iter().map(|(key, mut lock)| async move {
                let result = lock.sync(git, base, force).await;
                (key, lock, result)
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut failures = Vec::new();
        for (key, lock, result) in results {
            if let Err(e) = result {
                warn!(%key, error = %e, "sync failed, skipping source");
                failures.push(format!("{}: {}", key, e));
            }
            self.locks.insert(key, lock);
        }

        if failures.is_empty() {
            info!(count = self.locks.len(), "synced all tool package sources");
            Ok(())
        } else {
            failures.sort();
            Err(PocketError::Other(format!(
                "sync failed for {} source(s): {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lockfile = Lockfile::load(dir.path().join("pocket.lock"))
            .await
            .expect("load");
        assert!(lockfile.is_empty());
    }

    #[tokio::test]
    async fn save_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pocket.lock");

        let mut lockfile = Lockfile::new(&path);
        lockfile.add(Lock::git("https://github.com/org/tools", "main"));
        lockfile.add(Lock::local("/srv/tools/slack"));
        lockfile.save().await.expect("save");

        let reloaded = Lockfile::load(&path).await.expect("load");
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.get("local//srv/tools/slack").is_some());
        assert!(reloaded
            .get("git/https://github.com/org/tools#main")
            .is_some());
    }

    #[tokio::test]
    async fn add_is_idempotent_per_key() {
        let mut lockfile = Lockfile::new("/tmp/unused.lock");
        lockfile.add(Lock::git("https://github.com/org/tools", "main"));
        lockfile.add(Lock::git("https://github.com/org/tools", "main"));
        assert_eq!(lockfile.len(), 1);
    }

    #[tokio::test]
    async fn sync_all_reports_failures_but_keeps_going() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("present");
        tokio::fs::create_dir_all(&good).await.expect("mkdir");

        let mut lockfile = Lockfile::new(dir.path().join("pocket.lock"));
        lockfile.add(Lock::local(&good));
        lockfile.add(Lock::local(dir.path().join("absent")));

        let err = lockfile
            .sync_all(&GitClient::new(), dir.path(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 source(s)"));
        // Both locks survive the failed batch.
        assert_eq!(lockfile.len(), 2);
    }
}
