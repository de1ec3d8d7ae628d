//! Git operations over the `git` CLI
//!
//! Tool packages are fetched with shallow, ref-pinned fetches into the
//! package cache. Remote refs come from `git ls-remote`; branch listings are
//! cached per repository because GitHub tree URLs need them for
//! disambiguation.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PocketError, Result};

/// One entry from `git ls-remote`: (sha, fully qualified ref name)
pub type RemoteRef = (String, String);

pub struct GitClient {
    branch_cache: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitClient {
    pub fn new() -> Self {
        Self {
            branch_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn run(args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        debug!(?args, "running git");

        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PocketError::Runtime(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// All refs the remote advertises
    pub async fn ls_remote(&self, repository_url: &str) -> Result<Vec<RemoteRef>> {
        let output = Self::run(&["ls-remote", repository_url], None).await?;
        Ok(parse_ls_remote(&output))
    }

    /// Branch names of `repository_url`, cached for the client's lifetime
    pub async fn remote_branches(&self, repository_url: &str) -> Result<Vec<String>> {
        let mut cache = self.branch_cache.lock().await;
        if let Some(branches) = cache.get(repository_url) {
            return Ok(branches.clone());
        }
        let output = Self::run(&["ls-remote", "--heads", repository_url], None).await?;
        let branches: Vec<String> = parse_ls_remote(&output)
            .into_iter()
            .filter_map(|(_, name)| {
                name.strip_prefix("refs/heads/").map(|b| b.to_string())
            })
            .collect();
        cache.insert(repository_url.to_string(), branches.clone());
        Ok(branches)
    }

    /// Resolve `git_ref` to a commit SHA against the remote's advertised refs
    pub async fn resolve_ref(&self, repository_url: &str, git_ref: &str) -> Result<String> {
        let refs = self.ls_remote(repository_url).await?;
        pick_ref(&refs, git_ref).ok_or_else(|| PocketError::SyncFailure {
            source_id: repository_url.to_string(),
            reason: format!("ref `{}` not found on remote", git_ref),
        })
    }

    /// Split a GitHub tree URL into (repository URL, ref, subpath within the
    /// repo). Branch names may contain slashes, so the path segments after
    /// `/tree/` are matched against the remote's branch list.
    pub async fn parse_github_url(&self, url: &str) -> Result<(String, String, String)> {
        let trimmed = url.trim_end_matches('/');
        let rest = trimmed
            .strip_prefix("https://github.com/")
            .ok_or_else(|| PocketError::Manifest(format!("not a github url: {}", url)))?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() < 2 {
            return Err(PocketError::Manifest(format!("not a repository url: {}", url)));
        }

        let repository_url = format!("https://github.com/{}/{}", segments[0], segments[1]);
        if segments.len() == 2 {
            return Ok((repository_url, "HEAD".to_string(), String::new()));
        }
        if segments[2] != "tree" {
            return Err(PocketError::Manifest(format!(
                "expected /tree/ segment in {}",
                url
            )));
        }

        let branches = self.remote_branches(&repository_url).await?;
        let (branch, subpath) = split_branch(&segments[3..], &branches).ok_or_else(|| {
            PocketError::Manifest(format!("no branch of {} matches {}", repository_url, url))
        })?;
        Ok((repository_url, branch, subpath))
    }

    /// Materialize `sha` of `repository_url` at `dest` with a shallow fetch.
    /// An existing checkout is reset and cleaned rather than re-cloned.
    pub async fn fetch_to(&self, repository_url: &str, sha: &str, dest: &Path) -> Result<()> {
        if !dest.join(".git").exists() {
            tokio::fs::create_dir_all(dest).await?;
            Self::run(&["init", "-q"], Some(dest)).await?;
            Self::run(&["remote", "add", "origin", repository_url], Some(dest)).await?;
        }
        Self::run(&["fetch", "-q", "--depth", "1", "origin", sha], Some(dest)).await?;
        Self::run(&["reset", "-q", "--hard", "FETCH_HEAD"], Some(dest)).await?;
        Self::run(&["clean", "-fdq"], Some(dest)).await?;
        info!(%repository_url, %sha, dest = %dest.display(), "fetched tool package");
        Ok(())
    }
}

fn parse_ls_remote(output: &str) -> Vec<RemoteRef> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let sha = parts.next()?;
            let name = parts.next()?;
            Some((sha.to_string(), name.to_string()))
        })
        .collect()
}

/// Ref resolution order: an advertised SHA given verbatim, then the exact
/// ref name, then `refs/heads/`, then `refs/tags/`.
fn pick_ref(refs: &[RemoteRef], git_ref: &str) -> Option<String> {
    if refs.iter().any(|(sha, _)| sha == git_ref) {
        return Some(git_ref.to_string());
    }
    for candidate in [
        git_ref.to_string(),
        format!("refs/heads/{}", git_ref),
        format!("refs/tags/{}", git_ref),
    ] {
        if let Some((sha, _)) = refs.iter().find(|(_, name)| *name == candidate) {
            return Some(sha.clone());
        }
    }
    None
}

/// Match the leading path segments against known branch names; the shortest
/// matching prefix is the branch, the remainder the subpath.
fn split_branch(segments: &[&str], branches: &[String]) -> Option<(String, String)> {
    let mut candidate = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if !candidate.is_empty() {
            candidate.push('/');
        }
        candidate.push_str(segment);
        if branches.iter().any(|b| b == &candidate) {
            return Some((candidate, segments[i + 1..].join("/")));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA_MAIN: &str = "1111111111111111111111111111111111111111";
    const SHA_TAG: &str = "2222222222222222222222222222222222222222";

    fn refs() -> Vec<RemoteRef> {
        vec![
            (SHA_MAIN.to_string(), "refs/heads/main".to_string()),
            (SHA_MAIN.to_string(), "HEAD".to_string()),
            (SHA_TAG.to_string(), "refs/tags/v1.0".to_string()),
        ]
    }

    #[test]
    fn pick_ref_resolution_order() {
        let refs = refs();
        // A verbatim SHA wins even if no ref points at it by name.
        assert_eq!(pick_ref(&refs, SHA_TAG).as_deref(), Some(SHA_TAG));
        assert_eq!(pick_ref(&refs, "HEAD").as_deref(), Some(SHA_MAIN));
        assert_eq!(pick_ref(&refs, "main").as_deref(), Some(SHA_MAIN));
        assert_eq!(pick_ref(&refs, "v1.0").as_deref(), Some(SHA_TAG));
        assert_eq!(pick_ref(&refs, "missing"), None);
    }

    #[test]
    fn split_branch_handles_slashes() {
        let branches = vec!["main".to_string(), "feature/long/name".to_string()];

        let (branch, subpath) =
            split_branch(&["main", "tools", "slack"], &branches).expect("match");
        assert_eq!(branch, "main");
        assert_eq!(subpath, "tools/slack");

        let (branch, subpath) =
            split_branch(&["feature", "long", "name", "dir"], &branches).expect("match");
        assert_eq!(branch, "feature/long/name");
        assert_eq!(subpath, "dir");

        assert!(split_branch(&["unknown"], &branches).is_none());
    }

    #[test]
    fn parse_ls_remote_lines() {
        let out = format!("{}\tHEAD\n{}\trefs/heads/main\n", SHA_MAIN, SHA_MAIN);
        let refs = parse_ls_remote(&out);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].1, "refs/heads/main");
    }
}
