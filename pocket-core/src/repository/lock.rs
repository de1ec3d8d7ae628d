//! Tool package sources and their pinned state

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::git::GitClient;
use crate::error::{PocketError, Result};

/// Where a tool package comes from and, for git, what commit it is pinned to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Lock {
    /// Package on the local filesystem; copied into the cache on sync
    Local { tool_path: PathBuf },

    /// Package fetched from a git remote
    Git {
        repository_url: String,
        git_ref: String,
        /// Commit the ref resolved to at last sync
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ref_sha: Option<String>,
    },
}

impl Lock {
    pub fn local(tool_path: impl Into<PathBuf>) -> Self {
        Lock::Local {
            tool_path: tool_path.into(),
        }
    }

    pub fn git(repository_url: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Lock::Git {
            repository_url: repository_url.into(),
            git_ref: git_ref.into(),
            ref_sha: None,
        }
    }

    /// Identity of the source, independent of resolved state
    pub fn key(&self) -> String {
        match self {
            Lock::Local { tool_path } => format!("local/{}", tool_path.display()),
            Lock::Git {
                repository_url,
                git_ref,
                ..
            } => format!("git/{}#{}", repository_url, git_ref),
        }
    }

    /// Directory the synced package lives in under the package cache
    pub fn toolpkg_path(&self, base: &Path) -> PathBuf {
        match self {
            Lock::Local { tool_path } => {
                let rel = tool_path.to_string_lossy();
                base.join("local").join(sanitize(rel.trim_start_matches('/')))
            }
            Lock::Git {
                repository_url,
                git_ref,
                ref_sha,
            } => {
                let pin = ref_sha.as_deref().unwrap_or(git_ref.as_str());
                base.join(sanitize(strip_scheme(repository_url)))
                    .join(sanitize(pin))
            }
        }
    }

    /// Tab-delimited lockfile line. An unresolved git lock has no SHA field
    /// so the line survives whitespace trimming on reload.
    pub fn to_line(&self) -> String {
        match self {
            Lock::Local { tool_path } => format!("local\t{}", tool_path.display()),
            Lock::Git {
                repository_url,
                git_ref,
                ref_sha,
            } => match ref_sha {
                Some(sha) => format!("git\t{}\t{}\t{}", repository_url, git_ref, sha),
                None => format!("git\t{}\t{}", repository_url, git_ref),
            },
        }
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.as_slice() {
            ["local", path] => Ok(Lock::local(*path)),
            ["git", url, git_ref] => Ok(Lock::git(*url, *git_ref)),
            ["git", url, git_ref, sha] => Ok(Lock::Git {
                repository_url: url.to_string(),
                git_ref: git_ref.to_string(),
                ref_sha: if sha.is_empty() {
                    None
                } else {
                    Some(sha.to_string())
                },
            }),
            _ => Err(PocketError::Manifest(format!(
                "malformed lockfile line: {}",
                line
            ))),
        }
    }

    /// Bring the package cache up to date with this source. `force`
    /// re-resolves the ref and re-fetches even when a checkout exists.
    pub async fn sync(&mut self, git: &GitClient, base: &Path, force: bool) -> Result<()> {
        let key = self.key();

        let (repository_url, git_ref, pinned) = match &*self {
            Lock::Local { tool_path } => {
                if !tool_path.exists() {
                    return Err(PocketError::SyncFailure {
                        source_id: key,
                        reason: format!("local path does not exist: {}", tool_path.display()),
                    });
                }
                let dest = self.toolpkg_path(base);
                if force || !dest.exists() {
                    copy_tree(tool_path.clone(), dest).await.map_err(|e| {
                        PocketError::SyncFailure {
                            source_id: key,
                            reason: e.to_string(),
                        }
                    })?;
                }
                return Ok(());
            }
            Lock::Git {
                repository_url,
                git_ref,
                ref_sha,
            } => (repository_url.clone(), git_ref.clone(), ref_sha.clone()),
        };

        let sha = match (pinned, force) {
            (Some(sha), false) => sha,
            _ => {
                let sha = git
                    .resolve_ref(&repository_url, &git_ref)
                    .await
                    .map_err(|e| PocketError::SyncFailure {
                        source_id: key.clone(),
                        reason: e.to_string(),
                    })?;
                debug!(%repository_url, %git_ref, %sha, "resolved ref");
                if let Lock::Git { ref_sha, .. } = self {
                    *ref_sha = Some(sha.clone());
                }
                sha
            }
        };

        let dest = self.toolpkg_path(base);
        if force || !dest.exists() {
            git.fetch_to(&repository_url, &sha, &dest)
                .await
                .map_err(|e| PocketError::SyncFailure {
                    source_id: key,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// Replace a previous copy of a local package with a fresh one
async fn copy_tree(src: PathBuf, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        copy_tree_blocking(&src, &dest)
    })
    .await
    .map_err(|e| PocketError::Other(e.to_string()))?
}

fn copy_tree_blocking(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree_blocking(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn strip_scheme(url: &str) -> &str {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("git@")
}

/// Path-safe form of a URL or ref segment
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
