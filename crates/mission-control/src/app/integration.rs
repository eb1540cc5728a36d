//! Integration branch and worktree lifecycle.
//!
//! Every plan gets one throwaway branch, `mc/integration-<plan>`, checked
//! out in its own worktree under the project data directory. Completed job
//! branches merge into it and tests run there. Creation is tolerant of
//! leftovers from a crashed prior run.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::plan::PostCreateHook;
use crate::infra::git::{self, GitMutex};
use crate::infra::paths;
use crate::infra::worktree::{
    CreateWorktreeRequest, SyncOutcome, SyncSource, SyncStrategy, WorktreeProvider,
};

/// Branch and worktree created for one plan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntegrationInfo {
    pub branch: String,
    pub worktree_path: PathBuf,
}

/// Manages integration branches and their worktrees for one repository.
pub struct IntegrationBranches {
    mutex: GitMutex,
    project_dir: PathBuf,
    provider: Arc<dyn WorktreeProvider>,
    repo_root: PathBuf,
}

impl IntegrationBranches {
    /// Creates a manager with the default per-project data directory.
    pub fn new(repo_root: PathBuf, provider: Arc<dyn WorktreeProvider>, mutex: GitMutex) -> Self {
        let project_dir = paths::project_dir(&repo_root);

        Self::with_project_dir(repo_root, project_dir, provider, mutex)
    }

    /// Creates a manager with an explicit project data directory.
    pub fn with_project_dir(
        repo_root: PathBuf,
        project_dir: PathBuf,
        provider: Arc<dyn WorktreeProvider>,
        mutex: GitMutex,
    ) -> Self {
        Self {
            mutex,
            project_dir,
            provider,
            repo_root,
        }
    }

    /// Returns the branch name used for a plan.
    pub fn branch_name(plan_id: &str) -> String {
        format!("mc/integration-{plan_id}")
    }

    /// Returns the worktree directory used for a plan.
    pub fn worktree_path(&self, plan_id: &str) -> PathBuf {
        self.project_dir.join(format!("mc-integration-{plan_id}"))
    }

    /// Creates the integration branch and worktree for a plan.
    ///
    /// A branch surviving from a crashed prior run is deleted together with
    /// its worktree before recreating both. The branch starts at the current
    /// commit of the default branch (from `origin/HEAD`, else `main`).
    ///
    /// # Errors
    /// Returns an error when the base commit cannot be resolved or worktree
    /// creation fails.
    pub async fn create_integration_branch(
        &self,
        plan_id: &str,
        post_create: Option<PostCreateHook>,
    ) -> Result<IntegrationInfo, String> {
        let branch = Self::branch_name(plan_id);

        if git::branch_exists(self.repo_root.clone(), &branch).await? {
            debug!(%branch, "integration branch left over from a prior run, recreating");
            if let Err(error) = self.delete_integration_branch(plan_id).await {
                warn!(%branch, %error, "failed to clean up stale integration branch");
            }
        }

        let default_branch = git::resolve_default_branch(self.repo_root.clone()).await;
        let base_commit = self.resolve_base_commit(&default_branch).await?;

        let worktree_path = self
            .provider
            .create(CreateWorktreeRequest {
                branch: branch.clone(),
                base_path: self.worktree_path(plan_id),
                start_point: Some(base_commit),
                post_create,
            })
            .await?;

        Ok(IntegrationInfo {
            branch,
            worktree_path,
        })
    }

    /// Returns the worktree path for a plan's integration branch.
    ///
    /// # Errors
    /// Returns an error when the worktree is not registered with git.
    pub async fn get_integration_worktree(&self, plan_id: &str) -> Result<PathBuf, String> {
        let expected = self.worktree_path(plan_id);
        let canonical_expected = std::fs::canonicalize(&expected).unwrap_or_else(|_| expected.clone());
        let worktrees = self.provider.list().await?;

        worktrees
            .into_iter()
            .map(|info| info.path)
            .find(|path| *path == expected || *path == canonical_expected)
            .ok_or_else(|| format!("Integration worktree for plan {plan_id} is not registered"))
    }

    /// Deletes a plan's integration worktree and branch.
    ///
    /// Worktree removal is best-effort and branch deletion tolerates a
    /// branch that no longer exists, so this is safe to call on a partially
    /// torn-down plan.
    ///
    /// # Errors
    /// Returns an error when an existing branch cannot be deleted.
    pub async fn delete_integration_branch(&self, plan_id: &str) -> Result<(), String> {
        let worktree_path = self.worktree_path(plan_id);
        if let Err(error) = self.provider.remove(worktree_path.clone(), true).await {
            debug!(path = %worktree_path.display(), %error, "integration worktree removal skipped");
        }

        let branch = Self::branch_name(plan_id);
        let output = self
            .mutex
            .with_lock(|| {
                git::git_command(
                    self.repo_root.clone(),
                    vec!["branch".to_string(), "-D".to_string(), branch.clone()],
                )
            })
            .await?;
        if !output.success() && !output.stderr.contains("not found") {
            return Err(format!("Git branch deletion failed: {}", output.detail()));
        }

        Ok(())
    }

    /// Rebases a plan's integration worktree onto `origin/<default>`.
    ///
    /// On conflict the rebase is aborted and the conflicted files reported.
    ///
    /// # Errors
    /// Returns an error when the worktree is missing or the fetch fails.
    pub async fn refresh_integration_from_main(
        &self,
        plan_id: &str,
    ) -> Result<SyncOutcome, String> {
        let worktree_path = self.get_integration_worktree(plan_id).await?;

        self.provider
            .sync(worktree_path, SyncStrategy::Rebase, None, SyncSource::Origin)
            .await
    }

    async fn resolve_base_commit(&self, default_branch: &str) -> Result<String, String> {
        match git::rev_parse(self.repo_root.clone(), default_branch).await {
            Ok(commit) => Ok(commit),
            Err(local_error) => {
                // A fresh clone may track the default branch only remotely.
                git::rev_parse(self.repo_root.clone(), &format!("origin/{default_branch}"))
                    .await
                    .map_err(|_| local_error)
            }
        }
    }
}
