use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Folder name under a repository root that stores the persisted job table.
pub const JOB_DATA_DIR: &str = ".mission-control";

/// Current schema version written by [`JobState::empty`].
pub const JOB_STATE_VERSION: u32 = 1;

/// Schema versions this build can read.
pub const SUPPORTED_STATE_VERSIONS: [u32; 3] = [1, 2, 3];

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// High-level lifecycle state for one job.
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

/// Multiplexer placement for a job's interactive session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Session,
    Window,
}

/// Prompting mode the session was launched with.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    #[default]
    Vanilla,
    Plan,
    Ralph,
    Ulw,
}

/// One orchestrated coding job and its session side-channel metadata.
///
/// `multiplexer_target` and `name` are unique per live job; the store does
/// not enforce this, callers do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Stable job identifier.
    pub id: String,
    /// Human-facing unique name.
    pub name: String,
    /// Worktree directory the session runs in.
    pub worktree_path: PathBuf,
    /// Branch the worktree tracks. Absent for jobs launched without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Branch the job branched off from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// Terminal-multiplexer target (session or window name).
    pub multiplexer_target: String,
    /// Whether the session occupies its own multiplexer session or a window.
    pub placement: Placement,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Port of the session's embedded HTTP server, once registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Session id inside the embedded server used for prompt delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_session_id: Option<String>,
    /// Full server URL when the session advertises one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Prompting mode the session was launched with.
    #[serde(default)]
    pub mode: JobMode,
    /// Initial prompt the job was created with.
    pub prompt: String,
    /// Creation timestamp.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Completion timestamp, set when the monitor observes completion.
    #[serde(
        with = "time::serde::rfc3339::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<OffsetDateTime>,
    /// Exit code captured from the session process, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Job {
    /// Creates a running job with a fresh id and the current timestamp.
    pub fn new(name: &str, worktree_path: PathBuf, multiplexer_target: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            worktree_path,
            branch: None,
            base_branch: None,
            multiplexer_target: multiplexer_target.to_string(),
            placement: Placement::Session,
            status: JobStatus::Running,
            port: None,
            launch_session_id: None,
            server_url: None,
            mode: JobMode::Vanilla,
            prompt: String::new(),
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
            exit_code: None,
        }
    }
}

/// Partial overlay applied to a stored job by `update_job`.
///
/// `None` fields leave the stored value untouched. Side-channel fields use a
/// double `Option` so a patch can distinguish "leave alone" from "clear".
#[derive(Clone, Debug, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub port: Option<Option<u16>>,
    pub launch_session_id: Option<Option<String>>,
    pub server_url: Option<Option<String>>,
    pub completed_at: Option<OffsetDateTime>,
    pub exit_code: Option<i32>,
}

impl JobPatch {
    /// Applies every present field onto `job`.
    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(branch) = &self.branch {
            job.branch = Some(branch.clone());
        }
        if let Some(base_branch) = &self.base_branch {
            job.base_branch = Some(base_branch.clone());
        }
        if let Some(port) = self.port {
            job.port = port;
        }
        if let Some(launch_session_id) = &self.launch_session_id {
            job.launch_session_id = launch_session_id.clone();
        }
        if let Some(server_url) = &self.server_url {
            job.server_url = server_url.clone();
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
        if let Some(exit_code) = self.exit_code {
            job.exit_code = Some(exit_code);
        }
    }
}

/// Versioned snapshot of the full job table persisted as one JSON document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    /// Schema version; only versions 1 through 3 are recognized.
    pub version: u32,
    /// All known jobs in insertion order.
    pub jobs: Vec<Job>,
    /// Timestamp of the last successful save.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl JobState {
    /// Returns a fresh empty state at the current schema version.
    pub fn empty() -> Self {
        Self {
            version: JOB_STATE_VERSION,
            jobs: Vec::new(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trips_through_str() {
        // Arrange
        let statuses = [
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stopped,
        ];

        // Act & Assert
        for status in statuses {
            let parsed = status
                .to_string()
                .parse::<JobStatus>()
                .expect("failed to parse job status");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_job_serializes_with_camel_case_keys() {
        // Arrange
        let job = Job::new("api", PathBuf::from("/tmp/wt"), "mc-api");

        // Act
        let json = serde_json::to_value(&job).expect("failed to serialize job");

        // Assert
        assert_eq!(json["multiplexerTarget"], "mc-api");
        assert_eq!(json["status"], "running");
        assert!(json.get("completedAt").is_none());
    }

    #[test]
    fn test_job_patch_applies_only_present_fields() {
        // Arrange
        let mut job = Job::new("api", PathBuf::from("/tmp/wt"), "mc-api");
        job.port = Some(4100);
        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            exit_code: Some(0),
            ..JobPatch::default()
        };

        // Act
        patch.apply(&mut job);

        // Assert
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.port, Some(4100));
    }

    #[test]
    fn test_job_patch_can_clear_side_channel_fields() {
        // Arrange
        let mut job = Job::new("api", PathBuf::from("/tmp/wt"), "mc-api");
        job.port = Some(4100);
        job.launch_session_id = Some("ses_1".to_string());
        let patch = JobPatch {
            port: Some(None),
            launch_session_id: Some(None),
            ..JobPatch::default()
        };

        // Act
        patch.apply(&mut job);

        // Assert
        assert_eq!(job.port, None);
        assert_eq!(job.launch_session_id, None);
    }
}
