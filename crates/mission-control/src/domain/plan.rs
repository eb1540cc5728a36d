use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Lifecycle state for one planner-driven job.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanJobStatus {
    #[default]
    Queued,
    WaitingDeps,
    Running,
    Completed,
    Failed,
    ReadyToMerge,
    Merging,
    Merged,
    Conflict,
    NeedsRebase,
    Stopped,
    Canceled,
}

impl PlanJobStatus {
    /// Returns whether the job is finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanJobStatus::Merged
                | PlanJobStatus::Failed
                | PlanJobStatus::Stopped
                | PlanJobStatus::Canceled
        )
    }
}

impl fmt::Display for PlanJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlanJobStatus::Queued => "queued",
            PlanJobStatus::WaitingDeps => "waiting_deps",
            PlanJobStatus::Running => "running",
            PlanJobStatus::Completed => "completed",
            PlanJobStatus::Failed => "failed",
            PlanJobStatus::ReadyToMerge => "ready_to_merge",
            PlanJobStatus::Merging => "merging",
            PlanJobStatus::Merged => "merged",
            PlanJobStatus::Conflict => "conflict",
            PlanJobStatus::NeedsRebase => "needs_rebase",
            PlanJobStatus::Stopped => "stopped",
            PlanJobStatus::Canceled => "canceled",
        };

        write!(f, "{label}")
    }
}

/// Ordered actions executed after a worktree is created.
///
/// All paths are relative to the worktree root; the hook resolver rejects
/// absolute paths and `..` segments before anything runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCreateHook {
    /// Files copied from the main worktree, preserving relative paths.
    #[serde(default)]
    pub copy_files: Vec<String>,
    /// Directories symlinked from the main worktree.
    #[serde(default)]
    pub symlink_dirs: Vec<String>,
    /// Shell commands run with the new worktree as working directory.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl PostCreateHook {
    /// Returns whether the hook has no actions at all.
    pub fn is_empty(&self) -> bool {
        self.copy_files.is_empty() && self.symlink_dirs.is_empty() && self.commands.is_empty()
    }
}

/// One job as described by a plan, richer than the runtime [`super::job::Job`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Unique job name within the plan.
    pub name: String,
    /// Prompt handed to the session on launch.
    pub prompt: String,
    /// Globs describing the files this job is expected to touch.
    #[serde(default)]
    pub touch_set: Vec<String>,
    /// Names of jobs that must merge before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Scheduling priority; higher runs earlier among unblocked jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Current plan-level status.
    #[serde(default)]
    pub status: PlanJobStatus,
    /// Globs that route relayed findings into this job.
    #[serde(default)]
    pub relay_patterns: Vec<String>,
    /// Per-job post-create overrides merged over the config defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_create: Option<PostCreateHook>,
    /// Position in the merge train once the job is ready to merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_order: Option<u32>,
    /// Timestamp of a successful merge.
    #[serde(
        with = "time::serde::rfc3339::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub merged_at: Option<OffsetDateTime>,
    /// Last failure detail, when the job is in a failed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Supervision mode governing how much a plan asks before acting.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    Autopilot,
    Copilot,
    Supervisor,
}

/// Point at which a plan pauses for operator review.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    PreMerge,
    OnError,
    PrePr,
}

/// One planner run: the jobs plus the integration branch they merge into.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    pub id: String,
    pub name: String,
    pub mode: PlanMode,
    pub status: PlanJobStatus,
    pub jobs: Vec<JobSpec>,
    /// Throwaway branch completed jobs merge into.
    pub integration_branch: String,
    /// Worktree where the integration branch is checked out, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_worktree: Option<String>,
    /// Commit the integration branch was created from.
    pub base_commit: String,
    /// Active checkpoint, when the plan is paused for review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    /// Free-form context attached to the active checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_context: Option<String>,
    /// Append-only log of notable plan events.
    #[serde(default)]
    pub audit_log: Vec<String>,
}
