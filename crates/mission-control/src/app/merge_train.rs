//! Serialized, test-gated merge train.
//!
//! Completed job branches queue here and merge one at a time into the
//! integration worktree. Each merge is admitted only after the project's
//! test command passes there; any failure — conflict, failed commit, failed
//! dependency setup, failed or timed-out tests — rolls the worktree back to
//! the pre-merge commit and reports a structured result. No speculative or
//! parallel merging: strictly FIFO.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::domain::job::Job;
use crate::infra::git::{self, GitMutex, GitOutput};

/// Default wall-clock budget for test and dependency-install commands.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(600);

/// How a job branch lands on the integration branch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MergeStrategy {
    /// `git merge --squash` plus a single commit.
    #[default]
    Squash,
    /// Currently lands like [`MergeStrategy::Squash`]; a true
    /// fast-forward-only mode was never wired up by any caller.
    FfOnly,
    /// `git merge --no-ff` keeping the branch topology.
    Merge,
}

/// Merge train configuration.
#[derive(Clone, Debug)]
pub struct MergeTrainConfig {
    /// Test command run in the integration worktree; auto-detected from
    /// `package.json` when absent.
    pub test_command: Option<String>,
    pub test_timeout: Duration,
    pub merge_strategy: MergeStrategy,
    /// When non-empty these replace lockfile-based dependency installs.
    pub setup_commands: Vec<String>,
}

impl Default for MergeTrainConfig {
    fn default() -> Self {
        Self {
            test_command: None,
            test_timeout: DEFAULT_TEST_TIMEOUT,
            merge_strategy: MergeStrategy::default(),
            setup_commands: Vec::new(),
        }
    }
}

/// Why a merge was rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergeFailureKind {
    Conflict,
    TestFailure,
}

/// Outcome of one merge attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeResult {
    Success {
        merged_at: OffsetDateTime,
    },
    Failure {
        kind: MergeFailureKind,
        files: Vec<String>,
        output: String,
    },
}

impl MergeResult {
    /// Returns whether the merge landed.
    pub fn is_success(&self) -> bool {
        matches!(self, MergeResult::Success { .. })
    }

    fn test_failure(output: String) -> Self {
        MergeResult::Failure {
            kind: MergeFailureKind::TestFailure,
            files: Vec::new(),
            output,
        }
    }
}

/// FIFO queue of jobs waiting to merge into one integration worktree.
pub struct MergeTrain {
    config: MergeTrainConfig,
    mutex: GitMutex,
    queue: VecDeque<Job>,
    worktree: PathBuf,
}

impl MergeTrain {
    /// Creates a train targeting `worktree`.
    pub fn new(worktree: PathBuf, config: MergeTrainConfig, mutex: GitMutex) -> Self {
        Self {
            config,
            mutex,
            queue: VecDeque::new(),
            worktree,
        }
    }

    /// Appends a job to the tail of the queue.
    pub fn enqueue(&mut self, job: Job) {
        debug!(job = %job.name, position = self.queue.len(), "job enqueued for merge");
        self.queue.push_back(job);
    }

    /// Returns a defensive copy of the queue in merge order.
    pub fn queue(&self) -> Vec<Job> {
        self.queue.iter().cloned().collect()
    }

    /// Drops all queued jobs.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Returns whether any jobs are waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Merges the job at the head of the queue.
    ///
    /// Returns `None` when the queue is empty; failures are reported inside
    /// the [`MergeResult`], never as panics or early exits, so the train can
    /// keep processing later jobs.
    pub async fn process_next(&mut self) -> Option<(Job, MergeResult)> {
        let job = self.queue.pop_front()?;
        let result = self.merge_job(&job).await;
        match &result {
            MergeResult::Success { .. } => info!(job = %job.name, "merged into integration"),
            MergeResult::Failure { kind, .. } => {
                warn!(job = %job.name, ?kind, "merge rejected");
            }
        }

        Some((job, result))
    }

    /// Drains the queue, returning each job paired with its result.
    pub async fn process_all(&mut self) -> Vec<(Job, MergeResult)> {
        let mut results = Vec::new();
        while let Some(processed) = self.process_next().await {
            results.push(processed);
        }

        results
    }

    async fn merge_job(&self, job: &Job) -> MergeResult {
        let Some(branch) = job.branch.clone() else {
            return MergeResult::test_failure(format!("Job {} has no branch", job.name));
        };

        let head_before = match git::rev_parse(self.worktree.clone(), "HEAD").await {
            Ok(head) => head,
            Err(error) => return MergeResult::test_failure(error),
        };

        if let Some(failure) = self.apply_merge(job, &branch, &head_before).await {
            return failure;
        }

        let test_command = match self.resolve_test_command().await {
            Ok(test_command) => test_command,
            Err(error) => {
                self.rollback(&head_before).await;
                return MergeResult::test_failure(error);
            }
        };
        let Some(test_command) = test_command else {
            // Nothing to gate on.
            return MergeResult::Success {
                merged_at: OffsetDateTime::now_utc(),
            };
        };

        if let Some(failure) = self.ensure_test_dependencies(&head_before).await {
            return failure;
        }

        match self.run_gated_command(&test_command).await {
            Ok(CommandOutcome::Completed { success: true, .. }) => MergeResult::Success {
                merged_at: OffsetDateTime::now_utc(),
            },
            Ok(CommandOutcome::Completed { output, .. }) => {
                self.rollback(&head_before).await;
                MergeResult::test_failure(output)
            }
            Ok(CommandOutcome::TimedOut) => {
                self.rollback(&head_before).await;
                MergeResult::test_failure(format!(
                    "Test timed out after {}ms",
                    self.config.test_timeout.as_millis()
                ))
            }
            Err(error) => {
                self.rollback(&head_before).await;
                MergeResult::test_failure(error)
            }
        }
    }

    /// Runs the merge commands for the configured strategy.
    ///
    /// Returns `Some(failure)` after rolling back, `None` when the merge
    /// commit landed.
    async fn apply_merge(&self, job: &Job, branch: &str, head_before: &str) -> Option<MergeResult> {
        let commit_message = format!("Merge {}", job.name);

        match self.config.merge_strategy {
            MergeStrategy::Squash | MergeStrategy::FfOnly => {
                let merge = match self
                    .locked_git(vec![
                        "merge".to_string(),
                        "--squash".to_string(),
                        branch.to_string(),
                    ])
                    .await
                {
                    Ok(merge) => merge,
                    Err(error) => {
                        self.rollback(head_before).await;
                        return Some(MergeResult::test_failure(error));
                    }
                };
                if !merge.success() {
                    let files = git::conflict_files_from(&merge);
                    self.rollback(head_before).await;
                    return Some(MergeResult::Failure {
                        kind: MergeFailureKind::Conflict,
                        files,
                        output: merge.detail(),
                    });
                }

                let commit = match self
                    .locked_git(vec![
                        "commit".to_string(),
                        "-m".to_string(),
                        commit_message,
                    ])
                    .await
                {
                    Ok(commit) => commit,
                    Err(error) => {
                        self.rollback(head_before).await;
                        return Some(MergeResult::test_failure(error));
                    }
                };
                if !commit.success() {
                    self.rollback(head_before).await;
                    return Some(MergeResult::test_failure(commit.detail()));
                }
            }
            MergeStrategy::Merge => {
                let merge = match self
                    .locked_git(vec![
                        "merge".to_string(),
                        "--no-ff".to_string(),
                        "-m".to_string(),
                        commit_message,
                        branch.to_string(),
                    ])
                    .await
                {
                    Ok(merge) => merge,
                    Err(error) => {
                        self.rollback(head_before).await;
                        return Some(MergeResult::test_failure(error));
                    }
                };
                if !merge.success() {
                    let files = git::conflict_files_from(&merge);
                    self.rollback(head_before).await;
                    return Some(MergeResult::Failure {
                        kind: MergeFailureKind::Conflict,
                        files,
                        output: merge.detail(),
                    });
                }
            }
        }

        None
    }

    /// Makes sure the integration worktree can run tests.
    ///
    /// Configured setup commands take precedence; otherwise a lockfile-based
    /// install runs when `node_modules` is missing or a dangling symlink.
    /// Returns `Some(failure)` after rolling back on any failure or timeout.
    async fn ensure_test_dependencies(&self, head_before: &str) -> Option<MergeResult> {
        if !self.config.setup_commands.is_empty() {
            for command in self.config.setup_commands.clone() {
                if let Some(failure) = self.run_setup_command(&command, head_before).await {
                    return Some(failure);
                }
            }

            return None;
        }

        let worktree = self.worktree.clone();
        let install_command = spawn_blocking(move || {
            if node_modules_needs_install(&worktree) {
                detect_install_command(&worktree)
            } else {
                None
            }
        })
        .await
        .ok()
        .flatten();

        if let Some(command) = install_command {
            return self.run_setup_command(&command, head_before).await;
        }

        None
    }

    async fn run_setup_command(&self, command: &str, head_before: &str) -> Option<MergeResult> {
        match self.run_gated_command(command).await {
            Ok(CommandOutcome::Completed { success: true, .. }) => None,
            Ok(CommandOutcome::Completed { output, .. }) => {
                self.rollback(head_before).await;
                Some(MergeResult::test_failure(format!(
                    "Dependency setup command failed ({command})\n{output}"
                )))
            }
            Ok(CommandOutcome::TimedOut) => {
                self.rollback(head_before).await;
                Some(MergeResult::test_failure(format!(
                    "Dependency setup command timed out ({command})\nTimed out after {}ms",
                    self.config.test_timeout.as_millis()
                )))
            }
            Err(error) => {
                self.rollback(head_before).await;
                Some(MergeResult::test_failure(format!(
                    "Dependency setup command failed ({command})\n{error}"
                )))
            }
        }
    }

    /// Resolves the effective test command, if any.
    async fn resolve_test_command(&self) -> Result<Option<String>, String> {
        if let Some(test_command) = &self.config.test_command {
            return Ok(Some(test_command.clone()));
        }

        let worktree = self.worktree.clone();
        spawn_blocking(move || Ok(detect_test_command(&worktree)))
            .await
            .map_err(|error| format!("Join error: {error}"))?
    }

    /// Runs a shell command in the integration worktree under the test
    /// timeout, killing it on expiry.
    async fn run_gated_command(&self, command: &str) -> Result<CommandOutcome, String> {
        let mut child_command = tokio::process::Command::new("sh");
        child_command
            .arg("-c")
            .arg(command)
            .current_dir(&self.worktree)
            .kill_on_drop(true);

        match tokio::time::timeout(self.config.test_timeout, child_command.output()).await {
            Ok(Ok(output)) => Ok(CommandOutcome::Completed {
                success: output.status.success(),
                output: combined_output(&output.stdout, &output.stderr),
            }),
            Ok(Err(error)) => Err(format!("Failed to run command ({command}): {error}")),
            Err(_elapsed) => Ok(CommandOutcome::TimedOut),
        }
    }

    /// Restores the integration worktree to `head`, swallowing cleanup
    /// errors so the original failure stays visible.
    async fn rollback(&self, head: &str) {
        let _ = self
            .locked_git(vec!["merge".to_string(), "--abort".to_string()])
            .await;
        let _ = self
            .locked_git(vec![
                "reset".to_string(),
                "--hard".to_string(),
                head.to_string(),
            ])
            .await;
        let _ = self
            .locked_git(vec!["clean".to_string(), "-fd".to_string()])
            .await;
    }

    async fn locked_git(&self, args: Vec<String>) -> Result<GitOutput, String> {
        let worktree = self.worktree.clone();
        self.mutex
            .with_lock(|| git::git_command(worktree, args))
            .await
    }
}

enum CommandOutcome {
    Completed { success: bool, output: String },
    TimedOut,
}

/// Lockfiles and the install command each one implies; first match wins.
const LOCKFILE_INSTALL_COMMANDS: &[(&str, &str)] = &[
    ("bun.lockb", "bun install --frozen-lockfile"),
    ("bun.lock", "bun install --frozen-lockfile"),
    ("pnpm-lock.yaml", "pnpm install --frozen-lockfile"),
    ("yarn.lock", "yarn install --frozen-lockfile"),
    ("package-lock.json", "npm ci"),
    ("npm-shrinkwrap.json", "npm ci"),
];

const PACKAGE_MANAGER_PREFIXES: &[(&str, &str)] = &[("bun@", "bun"), ("pnpm@", "pnpm"), ("yarn@", "yarn")];

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout_text = String::from_utf8_lossy(stdout).trim().to_string();
    let stderr_text = String::from_utf8_lossy(stderr).trim().to_string();
    match (stdout_text.is_empty(), stderr_text.is_empty()) {
        (false, false) => format!("{stdout_text}\n{stderr_text}"),
        (false, true) => stdout_text,
        (true, false) => stderr_text,
        (true, true) => String::new(),
    }
}

/// Returns the install command implied by the worktree's lockfile, or the
/// `package.json#packageManager` fallback when no lockfile exists.
fn detect_install_command(worktree: &Path) -> Option<String> {
    for (lockfile, command) in LOCKFILE_INSTALL_COMMANDS {
        if worktree.join(lockfile).exists() {
            return Some((*command).to_string());
        }
    }

    let manifest = read_package_manifest(worktree)?;
    let package_manager = manifest.get("packageManager")?.as_str()?;
    for (prefix, binary) in PACKAGE_MANAGER_PREFIXES {
        if package_manager.starts_with(prefix) {
            return Some(format!("{binary} install"));
        }
    }

    None
}

/// Returns `<pm> test` when `package.json` declares a test script.
fn detect_test_command(worktree: &Path) -> Option<String> {
    let manifest = read_package_manifest(worktree)?;
    let has_test_script = manifest
        .get("scripts")
        .and_then(|scripts| scripts.get("test"))
        .and_then(|test| test.as_str())
        .is_some_and(|script| !script.trim().is_empty());
    if !has_test_script {
        return None;
    }

    Some(format!("{} test", package_manager_name(worktree)))
}

fn package_manager_name(worktree: &Path) -> &'static str {
    for (lockfile, command) in LOCKFILE_INSTALL_COMMANDS {
        if worktree.join(lockfile).exists() {
            return command.split_whitespace().next().unwrap_or("npm");
        }
    }

    if let Some(manifest) = read_package_manifest(worktree)
        && let Some(package_manager) = manifest.get("packageManager").and_then(|pm| pm.as_str())
    {
        for (prefix, binary) in PACKAGE_MANAGER_PREFIXES {
            if package_manager.starts_with(prefix) {
                return binary;
            }
        }
    }

    "npm"
}

/// Returns whether `node_modules` is absent or a symlink pointing nowhere.
fn node_modules_needs_install(worktree: &Path) -> bool {
    let node_modules = worktree.join("node_modules");
    match std::fs::symlink_metadata(&node_modules) {
        Err(_) => true,
        Ok(metadata) if metadata.file_type().is_symlink() => {
            std::fs::metadata(&node_modules).is_err()
        }
        Ok(_) => false,
    }
}

fn read_package_manifest(worktree: &Path) -> Option<serde_json::Value> {
    let raw = std::fs::read_to_string(worktree.join("package.json")).ok()?;

    serde_json::from_str(&raw).ok()
}
