use std::path::{Path, PathBuf};
use std::process::Command;

use tokio::task::spawn_blocking;

/// Captured result of one git invocation.
///
/// Non-zero exits are data, not errors; callers inspect `exit_code` and
/// decide. Only a failure to spawn `git` itself surfaces as `Err`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl GitOutput {
    /// Returns whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Extracts the best human-readable detail from the captured output.
    pub fn detail(&self) -> String {
        let stderr_text = self.stderr.trim();
        if !stderr_text.is_empty() {
            return stderr_text.to_string();
        }

        let stdout_text = self.stdout.trim();
        if !stdout_text.is_empty() {
            return stdout_text.to_string();
        }

        "Unknown git error".to_string()
    }
}

/// Runs `git` with the given arguments inside `repo_path`.
///
/// Mutating invocations must be wrapped in [`super::GitMutex`] by the
/// caller; readers (`rev-parse`, `worktree list`) may run unlocked.
///
/// # Arguments
/// * `repo_path` - Repository or worktree the command runs in
/// * `args` - Arguments passed to `git`
///
/// # Returns
/// The captured [`GitOutput`], regardless of exit status.
///
/// # Errors
/// Returns an error only if the `git` process cannot be spawned.
pub async fn git_command(repo_path: PathBuf, args: Vec<String>) -> Result<GitOutput, String> {
    spawn_blocking(move || git_command_sync(&repo_path, &args))
        .await
        .map_err(|error| format!("Join error: {error}"))?
}

/// Synchronous version of [`git_command`] for blocking contexts.
pub(crate) fn git_command_sync(repo_path: &Path, args: &[String]) -> Result<GitOutput, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .map_err(|error| format!("Failed to execute git: {error}"))?;

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Extracts conflicted file paths from merge/rebase stderr.
///
/// Scans for `CONFLICT (<kind>): <path>` lines, stripping the
/// `Merge conflict in ` prefix git adds for content conflicts. When no such
/// line parses, the trimmed stderr is returned as a single-element list so
/// the caller still has something actionable; blank stderr yields an empty
/// list.
pub fn parse_conflict_files(stderr: &str) -> Vec<String> {
    let files = scan_conflict_lines(stderr);
    if files.is_empty() {
        let trimmed = stderr.trim();
        if !trimmed.is_empty() {
            return vec![trimmed.to_string()];
        }
    }

    files
}

/// Extracts conflicted file paths from a full command capture.
///
/// Git writes `CONFLICT (…)` lines to stdout for merges and stderr for
/// rebases, so both streams are scanned; the raw-stderr fallback matches
/// [`parse_conflict_files`].
pub(crate) fn conflict_files_from(output: &GitOutput) -> Vec<String> {
    let mut files = scan_conflict_lines(&output.stdout);
    for file in scan_conflict_lines(&output.stderr) {
        if !files.contains(&file) {
            files.push(file);
        }
    }

    if files.is_empty() {
        let trimmed = output.stderr.trim();
        if !trimmed.is_empty() {
            return vec![trimmed.to_string()];
        }
    }

    files
}

fn scan_conflict_lines(text: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("CONFLICT (") else {
            continue;
        };
        let Some((_kind, detail)) = rest.split_once("): ") else {
            continue;
        };
        let path = detail.strip_prefix("Merge conflict in ").unwrap_or(detail);
        let path = path.trim();
        if !path.is_empty() && !files.contains(&path.to_string()) {
            files.push(path.to_string());
        }
    }

    files
}

/// Resolves the repository's default branch name.
///
/// Reads `refs/remotes/origin/HEAD`; when that symbolic ref is missing
/// (no remote, fresh clone without `origin/HEAD`), falls back to `main`.
pub async fn resolve_default_branch(repo_path: PathBuf) -> String {
    let output = git_command(
        repo_path,
        vec![
            "symbolic-ref".to_string(),
            "refs/remotes/origin/HEAD".to_string(),
        ],
    )
    .await;

    match output {
        Ok(output) if output.success() => {
            let reference = output.stdout.trim();
            reference
                .strip_prefix("refs/remotes/origin/")
                .unwrap_or("main")
                .to_string()
        }
        _ => "main".to_string(),
    }
}

/// Resolves a ref to its full commit hash.
///
/// # Errors
/// Returns an error when the ref does not resolve.
pub async fn rev_parse(repo_path: PathBuf, reference: &str) -> Result<String, String> {
    let output = git_command(
        repo_path,
        vec!["rev-parse".to_string(), reference.to_string()],
    )
    .await?;

    if !output.success() {
        return Err(format!("Failed to resolve {reference}: {}", output.detail()));
    }

    let hash = output.stdout.trim().to_string();
    if hash.is_empty() {
        return Err(format!("Failed to resolve {reference}: empty output"));
    }

    Ok(hash)
}

/// Returns whether a local branch with the given name exists.
///
/// # Errors
/// Returns an error if `git branch --list` cannot be executed.
pub async fn branch_exists(repo_path: PathBuf, branch_name: &str) -> Result<bool, String> {
    let output = git_command(
        repo_path,
        vec![
            "branch".to_string(),
            "--list".to_string(),
            branch_name.to_string(),
        ],
    )
    .await?;

    if !output.success() {
        return Err(format!("Failed to list branches: {}", output.detail()));
    }

    Ok(!output.stdout.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::process::Command;

    use tempfile::tempdir;

    use super::*;

    fn run_git_command(repo_path: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo_path)
            .output()
            .expect("failed to run git command");

        assert!(
            output.status.success(),
            "git command {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn setup_test_git_repo(repo_path: &Path) {
        run_git_command(repo_path, &["init", "-b", "main"]);
        run_git_command(repo_path, &["config", "user.name", "Test User"]);
        run_git_command(repo_path, &["config", "user.email", "test@example.com"]);

        fs::write(repo_path.join("README.md"), "test repo").expect("failed to write file");
        run_git_command(repo_path, &["add", "README.md"]);
        run_git_command(repo_path, &["commit", "-m", "Initial commit"]);
    }

    #[tokio::test]
    async fn test_git_command_captures_non_zero_exit_without_error() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        setup_test_git_repo(dir.path());

        // Act
        let output = git_command(
            dir.path().to_path_buf(),
            vec!["rev-parse".to_string(), "no-such-ref".to_string()],
        )
        .await
        .expect("failed to run git");

        // Assert
        assert_ne!(output.exit_code, 0);
        assert!(!output.detail().is_empty());
    }

    #[tokio::test]
    async fn test_rev_parse_returns_head_commit() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        setup_test_git_repo(dir.path());

        // Act
        let hash = rev_parse(dir.path().to_path_buf(), "HEAD")
            .await
            .expect("failed to resolve HEAD");

        // Assert
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|character| character.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_branch_exists_reports_known_and_unknown_branches() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        setup_test_git_repo(dir.path());

        // Act
        let main_exists = branch_exists(dir.path().to_path_buf(), "main")
            .await
            .expect("failed to list branches");
        let missing_exists = branch_exists(dir.path().to_path_buf(), "feat/none")
            .await
            .expect("failed to list branches");

        // Assert
        assert!(main_exists);
        assert!(!missing_exists);
    }

    #[tokio::test]
    async fn test_resolve_default_branch_falls_back_to_main() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        setup_test_git_repo(dir.path());

        // Act
        let default_branch = resolve_default_branch(dir.path().to_path_buf()).await;

        // Assert
        assert_eq!(default_branch, "main");
    }

    #[test]
    fn test_parse_conflict_files_extracts_paths() {
        // Arrange
        let stderr = "Auto-merging README.md\n\
                      CONFLICT (content): Merge conflict in README.md\n\
                      CONFLICT (add/add): Merge conflict in src/app.ts\n\
                      Automatic merge failed; fix conflicts and then commit the result.";

        // Act
        let files = parse_conflict_files(stderr);

        // Assert
        assert_eq!(files, vec!["README.md".to_string(), "src/app.ts".to_string()]);
    }

    #[test]
    fn test_parse_conflict_files_handles_paths_without_merge_prefix() {
        // Arrange
        let stderr = "CONFLICT (rename/delete): src/old.ts deleted in HEAD";

        // Act
        let files = parse_conflict_files(stderr);

        // Assert
        assert_eq!(files, vec!["src/old.ts deleted in HEAD".to_string()]);
    }

    #[test]
    fn test_parse_conflict_files_falls_back_to_raw_stderr() {
        // Arrange
        let stderr = "fatal: refusing to merge unrelated histories";

        // Act
        let files = parse_conflict_files(stderr);

        // Assert
        assert_eq!(files, vec![stderr.to_string()]);
    }

    #[test]
    fn test_parse_conflict_files_returns_empty_for_blank_stderr() {
        // Arrange
        let stderr = "   \n  ";

        // Act
        let files = parse_conflict_files(stderr);

        // Assert
        assert!(files.is_empty());
    }
}
