//! Atomically persisted job table.
//!
//! The whole table lives in one JSON document under
//! `<repo>/.mission-control/jobs.json`. Writes go to a same-directory
//! `.tmp` sibling and are renamed over the target, so readers never observe
//! a torn document; a crash mid-save loses at most the in-flight update.
//! Callers serialize writes by convention — the store itself adds no
//! cross-process locking.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

use crate::domain::job::{
    JOB_DATA_DIR, Job, JobPatch, JobState, SUPPORTED_STATE_VERSIONS,
};

/// File name of the persisted job table inside [`JOB_DATA_DIR`].
pub const JOB_STATE_FILE: &str = "jobs.json";

/// Typed failure surface of the job state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// No job with the given id exists in the table.
    #[error("job not found: {0}")]
    NotFound(String),
    /// The on-disk document declares a schema version this build cannot read.
    #[error("unsupported job state version: {0}")]
    UnsupportedVersion(u32),
    /// Reading or writing the state file failed.
    #[error("job state io failed: {0}")]
    Io(#[from] std::io::Error),
    /// The state file exists but is not a valid state document.
    #[error("failed to parse job state: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Load/modify/save access to the persisted job table.
#[derive(Clone, Debug)]
pub struct JobStateStore {
    path: PathBuf,
}

impl JobStateStore {
    /// Creates a store rooted at `<repo_root>/.mission-control/jobs.json`.
    pub fn new(repo_root: &Path) -> Self {
        Self {
            path: repo_root.join(JOB_DATA_DIR).join(JOB_STATE_FILE),
        }
    }

    /// Returns the path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the current snapshot, or a fresh empty state when absent.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, does not parse, or
    /// declares an unsupported schema version.
    pub async fn load(&self) -> Result<JobState, StateError> {
        let path = self.path.clone();
        spawn_blocking(move || load_sync(&path))
            .await
            .map_err(|error| StateError::Io(std::io::Error::other(error)))?
    }

    /// Saves `state` with `updated_at` refreshed, using atomic replacement.
    ///
    /// On successful return no `.tmp` sibling remains beside the target.
    ///
    /// # Errors
    /// Returns an error when serialization or the write/rename fails.
    pub async fn save(&self, mut state: JobState) -> Result<JobState, StateError> {
        state.updated_at = OffsetDateTime::now_utc();
        let path = self.path.clone();
        let saved = state.clone();
        spawn_blocking(move || save_sync(&path, &state))
            .await
            .map_err(|error| StateError::Io(std::io::Error::other(error)))??;

        Ok(saved)
    }

    /// Appends a job to the table.
    ///
    /// Duplicate ids are not prevented here; callers enforce uniqueness.
    ///
    /// # Errors
    /// Returns an error when the table cannot be loaded or saved.
    pub async fn add_job(&self, job: Job) -> Result<(), StateError> {
        let mut state = self.load().await?;
        state.jobs.push(job);
        self.save(state).await?;

        Ok(())
    }

    /// Applies `patch` to the job with the given id and returns the result.
    ///
    /// # Errors
    /// Returns [`StateError::NotFound`] when no job has that id.
    pub async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Job, StateError> {
        let mut state = self.load().await?;
        let job = state
            .jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        patch.apply(job);
        let updated = job.clone();
        self.save(state).await?;

        Ok(updated)
    }

    /// Removes the job with the given id.
    ///
    /// # Errors
    /// Returns [`StateError::NotFound`] when no job has that id.
    pub async fn remove_job(&self, id: &str) -> Result<(), StateError> {
        let mut state = self.load().await?;
        let before = state.jobs.len();
        state.jobs.retain(|job| job.id != id);
        if state.jobs.len() == before {
            return Err(StateError::NotFound(id.to_string()));
        }
        self.save(state).await?;

        Ok(())
    }

    /// Looks up a job by id.
    ///
    /// # Errors
    /// Returns an error when the table cannot be loaded.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, StateError> {
        let state = self.load().await?;

        Ok(state.jobs.into_iter().find(|job| job.id == id))
    }

    /// Looks up a job by name.
    ///
    /// # Errors
    /// Returns an error when the table cannot be loaded.
    pub async fn get_job_by_name(&self, name: &str) -> Result<Option<Job>, StateError> {
        let state = self.load().await?;

        Ok(state.jobs.into_iter().find(|job| job.name == name))
    }

    /// Returns all jobs currently in `running` status.
    ///
    /// # Errors
    /// Returns an error when the table cannot be loaded.
    pub async fn get_running_jobs(&self) -> Result<Vec<Job>, StateError> {
        let state = self.load().await?;

        Ok(state
            .jobs
            .into_iter()
            .filter(|job| job.status == crate::domain::job::JobStatus::Running)
            .collect())
    }
}

fn load_sync(path: &Path) -> Result<JobState, StateError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(JobState::empty());
        }
        Err(error) => return Err(error.into()),
    };

    let state: JobState = serde_json::from_str(&raw)?;
    if !SUPPORTED_STATE_VERSIONS.contains(&state.version) {
        return Err(StateError::UnsupportedVersion(state.version));
    }

    Ok(state)
}

fn save_sync(path: &Path, state: &JobState) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let serialized = serde_json::to_string_pretty(state)?;
    // The temp file must sit beside the target: a cross-filesystem rename
    // is not atomic.
    let temp_path = temp_sibling(path);
    fs::write(&temp_path, serialized)?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut file_name = path
        .file_name()
        .map_or_else(|| JOB_STATE_FILE.into(), std::ffi::OsStr::to_os_string);
    file_name.push(".tmp");

    path.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use crate::domain::job::{JOB_STATE_VERSION, JobStatus};

    use super::*;

    fn job_named(name: &str) -> Job {
        Job::new(
            name,
            PathBuf::from(format!("/tmp/{name}")),
            &format!("mc-{name}"),
        )
    }

    #[tokio::test]
    async fn test_load_returns_fresh_state_when_file_absent() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());

        // Act
        let state = store.load().await.expect("failed to load state");

        // Assert
        assert_eq!(state.version, JOB_STATE_VERSION);
        assert!(state.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips_with_advanced_timestamp() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());
        let mut state = JobState::empty();
        let stale = state.updated_at;
        state.jobs.push(job_named("api"));

        // Act
        let saved = store.save(state.clone()).await.expect("failed to save");
        let loaded = store.load().await.expect("failed to load state");

        // Assert
        assert_eq!(loaded.jobs, state.jobs);
        assert_eq!(loaded.updated_at, saved.updated_at);
        assert!(loaded.updated_at >= stale);
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_sibling() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());

        // Act
        store
            .save(JobState::empty())
            .await
            .expect("failed to save state");

        // Assert
        let temp_path = store.path().with_file_name("jobs.json.tmp");
        assert!(store.path().exists());
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_stale_temp_file_does_not_corrupt_live_state() {
        // Arrange: a crashed writer left a garbage temp sibling behind.
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());
        store
            .save(JobState::empty())
            .await
            .expect("failed to save state");
        let temp_path = store.path().with_file_name("jobs.json.tmp");
        std::fs::write(&temp_path, "{ torn").expect("failed to write temp file");

        // Act
        let state = store.load().await.expect("failed to load state");
        store.save(state).await.expect("failed to save state");

        // Assert
        assert!(store.load().await.is_ok());
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_load_rejects_unsupported_version() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());
        let mut state = JobState::empty();
        state.version = 9;
        std::fs::create_dir_all(store.path().parent().expect("state path has a parent"))
            .expect("failed to create state dir");
        std::fs::write(
            store.path(),
            serde_json::to_string(&state).expect("failed to serialize"),
        )
        .expect("failed to write state");

        // Act
        let result = store.load().await;

        // Assert
        assert!(matches!(result, Err(StateError::UnsupportedVersion(9))));
    }

    #[tokio::test]
    async fn test_update_job_applies_patch_and_persists() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());
        let job = job_named("api");
        let id = job.id.clone();
        store.add_job(job).await.expect("failed to add job");
        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            exit_code: Some(0),
            ..JobPatch::default()
        };

        // Act
        let updated = store.update_job(&id, &patch).await.expect("failed to update");
        let reloaded = store
            .get_job(&id)
            .await
            .expect("failed to get job")
            .expect("job should exist");

        // Assert
        assert_eq!(updated.status, JobStatus::Completed);
        assert_eq!(reloaded.status, JobStatus::Completed);
        assert_eq!(reloaded.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_update_job_fails_for_unknown_id() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());

        // Act
        let result = store.update_job("missing", &JobPatch::default()).await;

        // Assert
        assert!(matches!(result, Err(StateError::NotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_remove_job_fails_for_unknown_id() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());

        // Act
        let result = store.remove_job("missing").await;

        // Assert
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_running_jobs_filters_by_status() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());
        let running = job_named("running");
        let mut stopped = job_named("stopped");
        stopped.status = JobStatus::Stopped;
        store.add_job(running.clone()).await.expect("failed to add");
        store.add_job(stopped).await.expect("failed to add");

        // Act
        let running_jobs = store
            .get_running_jobs()
            .await
            .expect("failed to list running jobs");

        // Assert
        assert_eq!(running_jobs.len(), 1);
        assert_eq!(running_jobs[0].id, running.id);
    }

    #[tokio::test]
    async fn test_get_job_by_name_finds_job() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let store = JobStateStore::new(dir.path());
        store
            .add_job(job_named("api"))
            .await
            .expect("failed to add job");

        // Act
        let found = store
            .get_job_by_name("api")
            .await
            .expect("failed to look up job");
        let missing = store
            .get_job_by_name("worker")
            .await
            .expect("failed to look up job");

        // Assert
        assert!(found.is_some());
        assert!(missing.is_none());
    }
}
