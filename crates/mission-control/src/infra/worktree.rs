//! Git worktree lifecycle: create, remove, list, and sync.
//!
//! The provider is the only component that talks to the `git worktree`
//! command surface. Post-creation setup (file copies, directory symlinks,
//! shell commands) runs here, in that order, with the new worktree as the
//! working directory for commands.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use tokio::task::spawn_blocking;
use tracing::warn;

use crate::domain::plan::PostCreateHook;
use crate::infra::git::{self, GitMutex, GitOutput};

/// Identity of one worktree registered with git.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorktreeInfo {
    /// Checkout directory.
    pub path: PathBuf,
    /// Branch the worktree tracks; `None` for a detached checkout.
    pub branch: Option<String>,
    /// Full commit hash of the worktree's `HEAD`.
    pub head: String,
    /// Whether this is the repository's own (primary) checkout.
    pub is_main: bool,
}

/// How [`WorktreeProvider::sync`] brings a worktree up to date.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncStrategy {
    Rebase,
    Merge,
}

/// Where the sync base comes from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncSource {
    Local,
    Origin,
}

/// Result of one sync attempt.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncOutcome {
    pub success: bool,
    /// Conflicted files when the sync stopped; empty on success.
    pub conflicts: Vec<String>,
}

/// Inputs for [`WorktreeProvider::create`].
#[derive(Clone, Debug, Default)]
pub struct CreateWorktreeRequest {
    /// Branch the worktree will track; created when missing.
    pub branch: String,
    /// Directory the worktree is created at.
    pub base_path: PathBuf,
    /// Commit or ref the branch is created from; current `HEAD` when absent.
    pub start_point: Option<String>,
    /// Setup actions run after the worktree exists.
    pub post_create: Option<PostCreateHook>,
}

/// Polymorphic worktree operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorktreeProvider: Send + Sync {
    /// Creates a worktree (and its branch, when missing) and runs the
    /// post-create hook. Returns the absolute worktree path.
    ///
    /// # Errors
    /// Returns an error when branch creation, `git worktree add`, or any
    /// hook step fails.
    async fn create(&self, request: CreateWorktreeRequest) -> Result<PathBuf, String>;

    /// Removes a worktree. Without `force`, a dirty worktree is refused.
    ///
    /// # Errors
    /// Returns an error for a dirty unforced removal or a git failure.
    async fn remove(&self, path: PathBuf, force: bool) -> Result<(), String>;

    /// Lists all worktrees registered with the repository.
    ///
    /// # Errors
    /// Returns an error when the listing cannot be read.
    async fn list(&self) -> Result<Vec<WorktreeInfo>, String>;

    /// Rebases or merges the worktree onto `base_branch` (the default branch
    /// when absent), fetching first when `source` is origin.
    ///
    /// On conflict the in-progress operation is aborted and the conflicted
    /// files are reported in the outcome.
    ///
    /// # Errors
    /// Returns an error for non-conflict git failures.
    async fn sync(
        &self,
        path: PathBuf,
        strategy: SyncStrategy,
        base_branch: Option<String>,
        source: SyncSource,
    ) -> Result<SyncOutcome, String>;
}

/// Default provider over the `git worktree` command surface.
#[derive(Clone)]
pub struct GitWorktreeProvider {
    mutex: GitMutex,
    repo_root: PathBuf,
}

impl GitWorktreeProvider {
    /// Creates a provider for the repository at `repo_root`, serializing
    /// mutating git calls through `mutex`.
    pub fn new(repo_root: PathBuf, mutex: GitMutex) -> Self {
        Self { mutex, repo_root }
    }

    async fn locked_git(&self, repo_path: PathBuf, args: Vec<String>) -> Result<GitOutput, String> {
        self.mutex
            .with_lock(|| git::git_command(repo_path, args))
            .await
    }

    async fn ensure_branch(&self, branch: &str, start_point: Option<&str>) -> Result<(), String> {
        if git::branch_exists(self.repo_root.clone(), branch).await? {
            return Ok(());
        }

        let start_point = start_point.unwrap_or("HEAD").to_string();
        let output = self
            .locked_git(
                self.repo_root.clone(),
                vec!["branch".to_string(), branch.to_string(), start_point],
            )
            .await?;
        if !output.success() {
            return Err(format!(
                "Failed to create branch {branch}: {}",
                output.detail()
            ));
        }

        Ok(())
    }

    async fn run_post_create(
        &self,
        worktree_path: PathBuf,
        hook: PostCreateHook,
    ) -> Result<(), String> {
        let repo_root = self.repo_root.clone();
        spawn_blocking(move || run_post_create_sync(&repo_root, &worktree_path, &hook))
            .await
            .map_err(|error| format!("Join error: {error}"))?
    }
}

#[async_trait]
impl WorktreeProvider for GitWorktreeProvider {
    async fn create(&self, request: CreateWorktreeRequest) -> Result<PathBuf, String> {
        let CreateWorktreeRequest {
            branch,
            base_path,
            start_point,
            post_create,
        } = request;

        self.ensure_branch(&branch, start_point.as_deref()).await?;

        {
            let base_path = base_path.clone();
            spawn_blocking(move || -> Result<(), String> {
                if let Some(parent) = base_path.parent() {
                    fs::create_dir_all(parent).map_err(|error| {
                        format!("Failed to create worktree parent directory: {error}")
                    })?;
                }

                Ok(())
            })
            .await
            .map_err(|error| format!("Join error: {error}"))??;
        }

        let output = self
            .locked_git(
                self.repo_root.clone(),
                vec![
                    "worktree".to_string(),
                    "add".to_string(),
                    base_path.to_string_lossy().into_owned(),
                    branch.clone(),
                ],
            )
            .await?;
        if !output.success() {
            return Err(format!(
                "Git worktree command failed: {}",
                output.detail()
            ));
        }

        if let Some(hook) = post_create
            && !hook.is_empty()
        {
            self.run_post_create(base_path.clone(), hook).await?;
        }

        let absolute = fs::canonicalize(&base_path).unwrap_or(base_path);

        Ok(absolute)
    }

    async fn remove(&self, path: PathBuf, force: bool) -> Result<(), String> {
        if !force {
            let status = git::git_command(
                path.clone(),
                vec!["status".to_string(), "--porcelain".to_string()],
            )
            .await?;
            if !status.success() {
                return Err(format!(
                    "Failed to inspect worktree state: {}",
                    status.detail()
                ));
            }
            if !status.stdout.trim().is_empty() {
                return Err(format!(
                    "Worktree has uncommitted changes: {}",
                    path.display()
                ));
            }
        }

        let mut args = vec!["worktree".to_string(), "remove".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(path.to_string_lossy().into_owned());

        let output = self.locked_git(self.repo_root.clone(), args).await?;
        if !output.success() {
            return Err(format!(
                "Git worktree command failed: {}",
                output.detail()
            ));
        }

        // git occasionally leaves the directory itself behind; clean up
        // best-effort.
        if path.exists()
            && let Err(error) = fs::remove_dir_all(&path)
        {
            warn!(path = %path.display(), %error, "failed to delete leftover worktree directory");
        }

        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorktreeInfo>, String> {
        let output = git::git_command(
            self.repo_root.clone(),
            vec![
                "worktree".to_string(),
                "list".to_string(),
                "--porcelain".to_string(),
            ],
        )
        .await?;
        if !output.success() {
            return Err(format!("Failed to list worktrees: {}", output.detail()));
        }

        Ok(parse_worktree_list(&output.stdout))
    }

    async fn sync(
        &self,
        path: PathBuf,
        strategy: SyncStrategy,
        base_branch: Option<String>,
        source: SyncSource,
    ) -> Result<SyncOutcome, String> {
        if source == SyncSource::Origin {
            let fetch = self
                .locked_git(
                    path.clone(),
                    vec!["fetch".to_string(), "origin".to_string()],
                )
                .await?;
            if !fetch.success() {
                return Err(format!("Git fetch failed: {}", fetch.detail()));
            }
        }

        let base_branch = match base_branch {
            Some(base_branch) => base_branch,
            None => git::resolve_default_branch(path.clone()).await,
        };
        let base_ref = match source {
            SyncSource::Origin => format!("origin/{base_branch}"),
            SyncSource::Local => base_branch,
        };

        let sync_args = match strategy {
            SyncStrategy::Rebase => vec!["rebase".to_string(), base_ref],
            SyncStrategy::Merge => vec!["merge".to_string(), base_ref],
        };
        let output = self.locked_git(path.clone(), sync_args).await?;
        if output.success() {
            return Ok(SyncOutcome {
                success: true,
                conflicts: Vec::new(),
            });
        }

        // Abort whatever half-applied state the failure left behind so the
        // worktree stays usable.
        let abort_args = match strategy {
            SyncStrategy::Rebase => vec!["rebase".to_string(), "--abort".to_string()],
            SyncStrategy::Merge => vec!["merge".to_string(), "--abort".to_string()],
        };
        let _ = self.locked_git(path, abort_args).await;

        Ok(SyncOutcome {
            success: false,
            conflicts: git::conflict_files_from(&output),
        })
    }
}

fn run_post_create_sync(
    repo_root: &Path,
    worktree_path: &Path,
    hook: &PostCreateHook,
) -> Result<(), String> {
    for file in &hook.copy_files {
        let source = repo_root.join(file);
        let destination = worktree_path.join(file);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| format!("Failed to prepare copy target for {file}: {error}"))?;
        }
        fs::copy(&source, &destination)
            .map_err(|error| format!("Failed to copy {file}: {error}"))?;
    }

    for dir in &hook.symlink_dirs {
        let source = repo_root.join(dir);
        let destination = worktree_path.join(dir);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| format!("Failed to prepare symlink target for {dir}: {error}"))?;
        }
        remove_existing_entry(&destination);
        std::os::unix::fs::symlink(&source, &destination)
            .map_err(|error| format!("Failed to symlink {dir}: {error}"))?;
    }

    for command in &hook.commands {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(worktree_path)
            .output()
            .map_err(|error| format!("Failed to run post-create command ({command}): {error}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);

            return Err(format!(
                "Post-create command failed ({command}): {}",
                stderr.trim()
            ));
        }
    }

    Ok(())
}

/// Removes whatever currently sits at `path`, file, dir, or dangling link.
fn remove_existing_entry(path: &Path) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(error) = result {
        warn!(path = %path.display(), %error, "failed to replace existing entry");
    }
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeInfo> {
    let mut infos: Vec<WorktreeInfo> = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                infos.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                branch: None,
                head: String::new(),
                is_main: infos.is_empty(),
            });
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            if let Some(info) = current.as_mut() {
                info.head = head.to_string();
            }
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(info) = current.as_mut() {
                info.branch = Some(
                    branch
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch)
                        .to_string(),
                );
            }
        }
    }
    if let Some(info) = current.take() {
        infos.push(info);
    }

    infos
}
