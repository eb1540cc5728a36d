//! Cross-job finding relay.
//!
//! Jobs work in isolated worktrees and cannot see each other's edits, so a
//! finding in one job (an endpoint removed, a type renamed) that affects
//! another must travel out of band. Each registered job gets an inbox and an
//! optional compiled glob set; findings are appended to the recipient's
//! inbox and delivered into its live session as a formatted prompt.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::domain::job::Job;
use crate::domain::plan::JobSpec;
use crate::infra::sdk::{HttpPromptSink, PromptSink};

/// Readiness deadline used before delivering into a session.
const DELIVERY_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Weight of one relayed finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Upper-case label used in delivered prompts.
    pub fn as_upper(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

/// Payload of one relayed finding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayContext {
    /// What was discovered.
    pub finding: String,
    /// File the finding concerns, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Line within `file_path`, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    /// Weight of the finding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

/// One message waiting in a recipient's inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub from: String,
    pub to: String,
    pub context: RelayContext,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

struct JobChannel {
    inbox: VecDeque<RelayMessage>,
    globs: Option<GlobSet>,
    raw_patterns: Vec<String>,
}

impl JobChannel {
    fn empty() -> Self {
        Self {
            inbox: VecDeque::new(),
            globs: None,
            raw_patterns: Vec::new(),
        }
    }
}

/// Per-job inboxes plus glob-based routing.
pub struct JobComms {
    channels: HashMap<String, JobChannel>,
    sink: Arc<dyn PromptSink>,
}

impl Default for JobComms {
    fn default() -> Self {
        Self::new()
    }
}

impl JobComms {
    /// Creates a bus delivering over the real session HTTP client.
    pub fn new() -> Self {
        Self::with_sink(Arc::new(HttpPromptSink))
    }

    /// Creates a bus delivering through the given sink.
    pub fn with_sink(sink: Arc<dyn PromptSink>) -> Self {
        Self {
            channels: HashMap::new(),
            sink,
        }
    }

    /// Registers a job: compiles its relay patterns and ensures an inbox.
    ///
    /// # Errors
    /// Returns an error when a relay pattern does not compile.
    pub fn register_job(&mut self, spec: &JobSpec) -> Result<(), String> {
        let globs = if spec.relay_patterns.is_empty() {
            None
        } else {
            Some(compile_patterns(&spec.relay_patterns)?)
        };

        let channel = self
            .channels
            .entry(spec.name.clone())
            .or_insert_with(JobChannel::empty);
        channel.globs = globs;
        channel.raw_patterns = spec.relay_patterns.clone();

        Ok(())
    }

    /// Removes a job's inbox and patterns.
    pub fn unregister_job(&mut self, name: &str) {
        self.channels.remove(name);
    }

    /// Appends a finding to `to`'s inbox, creating the inbox on demand.
    pub fn relay_finding(&mut self, from: &str, to: &str, context: RelayContext) {
        let channel = self
            .channels
            .entry(to.to_string())
            .or_insert_with(JobChannel::empty);
        channel.inbox.push_back(RelayMessage {
            from: from.to_string(),
            to: to.to_string(),
            context,
            timestamp: OffsetDateTime::now_utc(),
        });
    }

    /// Returns whether any of the job's compiled globs match `file_path`.
    pub fn should_relay_for_file(&self, job_name: &str, file_path: &str) -> bool {
        self.channels
            .get(job_name)
            .and_then(|channel| channel.globs.as_ref())
            .is_some_and(|globs| globs.is_match(file_path))
    }

    /// Returns how many messages wait in a job's inbox.
    pub fn pending_messages(&self, job_name: &str) -> usize {
        self.channels
            .get(job_name)
            .map_or(0, |channel| channel.inbox.len())
    }

    /// Returns the raw pattern strings a job registered with.
    pub fn relay_patterns(&self, job_name: &str) -> &[String] {
        self.channels
            .get(job_name)
            .map_or(&[], |channel| channel.raw_patterns.as_slice())
    }

    /// Delivers the job's pending messages into its live session.
    ///
    /// Returns 0 without touching the inbox when the job has no port, the
    /// inbox is empty, `filter_from` excludes everything, or the session
    /// cannot be reached. On success the delivered messages are removed and
    /// their count returned.
    pub async fn deliver_messages(&mut self, job: &Job, filter_from: Option<&str>) -> usize {
        let Some(port) = job.port else {
            return 0;
        };
        let Some(channel) = self.channels.get(&job.name) else {
            return 0;
        };

        let to_deliver: Vec<RelayMessage> = channel
            .inbox
            .iter()
            .filter(|message| filter_from.is_none_or(|from| message.from == from))
            .cloned()
            .collect();
        if to_deliver.is_empty() {
            return 0;
        }

        let Some(session_id) = job.launch_session_id.clone() else {
            warn!(job = %job.name, "cannot deliver relay messages without a session id");
            return 0;
        };

        if let Err(error) = self.sink.wait_ready(port, DELIVERY_READY_TIMEOUT).await {
            debug!(job = %job.name, %error, "session not ready, keeping inbox");
            return 0;
        }

        for message in &to_deliver {
            let prompt = format_relay_prompt(message);
            if let Err(error) = self
                .sink
                .send_prompt(port, session_id.clone(), prompt)
                .await
            {
                warn!(job = %job.name, %error, "relay delivery failed, keeping inbox");
                return 0;
            }
        }

        if let Some(channel) = self.channels.get_mut(&job.name) {
            match filter_from {
                Some(from) => channel.inbox.retain(|message| message.from != from),
                None => channel.inbox.clear(),
            }
        }

        to_deliver.len()
    }
}

/// Renders one relayed finding as the prompt pushed into a session.
fn format_relay_prompt(message: &RelayMessage) -> String {
    let mut lines = vec![format!("[Inter-Job Communication from {}]", message.from)];
    if let Some(severity) = message.context.severity {
        lines.push(format!("Severity: {}", severity.as_upper()));
    }
    lines.push(format!("Finding: {}", message.context.finding));
    if let Some(file_path) = &message.context.file_path {
        lines.push(format!("File: {file_path}"));
    }
    if let Some(line_number) = message.context.line_number {
        lines.push(format!("Line: {line_number}"));
    }
    lines.push(String::new());
    lines.push("Consider how this finding may affect your current work.".to_string());

    lines.join("\n")
}

/// Compiles relay patterns into one matcher.
///
/// A trailing `/` means "everything under this directory" and expands to
/// `/**`; `*` stays within one path segment while `**` crosses them.
fn compile_patterns(patterns: &[String]) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let normalized = if pattern.ends_with('/') {
            format!("{pattern}**")
        } else {
            pattern.clone()
        };
        let glob = GlobBuilder::new(&normalized)
            .literal_separator(true)
            .build()
            .map_err(|error| format!("Failed to compile relay pattern `{pattern}`: {error}"))?;
        builder.add(glob);
    }

    builder
        .build()
        .map_err(|error| format!("Failed to compile relay patterns: {error}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::domain::plan::JobSpec;
    use crate::infra::sdk::MockPromptSink;

    use super::*;

    fn spec_with_patterns(name: &str, patterns: &[&str]) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            relay_patterns: patterns.iter().map(ToString::to_string).collect(),
            ..JobSpec::default()
        }
    }

    fn reachable_job(name: &str) -> Job {
        let mut job = Job::new(name, PathBuf::from("/tmp/wt"), &format!("mc-{name}"));
        job.port = Some(4100);
        job.launch_session_id = Some("ses_1".to_string());
        job
    }

    fn context(finding: &str) -> RelayContext {
        RelayContext {
            finding: finding.to_string(),
            file_path: None,
            line_number: None,
            severity: None,
        }
    }

    #[test]
    fn test_glob_routing_matches_recursive_patterns() {
        // Arrange
        let mut comms = JobComms::with_sink(Arc::new(MockPromptSink::new()));
        comms
            .register_job(&spec_with_patterns("api", &["src/**"]))
            .expect("failed to register job");

        // Act & Assert
        assert!(comms.should_relay_for_file("api", "src/lib/foo.ts"));
        assert!(!comms.should_relay_for_file("api", "tests/foo.test.ts"));
    }

    #[test]
    fn test_trailing_slash_expands_to_directory_glob() {
        // Arrange
        let mut comms = JobComms::with_sink(Arc::new(MockPromptSink::new()));
        comms
            .register_job(&spec_with_patterns("docs", &["docs/"]))
            .expect("failed to register job");

        // Act & Assert
        assert!(comms.should_relay_for_file("docs", "docs/guide.md"));
        assert!(!comms.should_relay_for_file("docs", "src/app.ts"));
    }

    #[test]
    fn test_unregistered_job_matches_nothing() {
        // Arrange
        let comms = JobComms::with_sink(Arc::new(MockPromptSink::new()));

        // Act & Assert
        assert!(!comms.should_relay_for_file("ghost", "src/app.ts"));
    }

    #[test]
    fn test_relay_finding_creates_inbox_on_demand() {
        // Arrange
        let mut comms = JobComms::with_sink(Arc::new(MockPromptSink::new()));

        // Act
        comms.relay_finding("api", "worker", context("Endpoint removed"));

        // Assert
        assert_eq!(comms.pending_messages("worker"), 1);
    }

    #[tokio::test]
    async fn test_deliver_messages_formats_prompt_and_clears_inbox() {
        // Arrange
        let mut sink = MockPromptSink::new();
        sink.expect_wait_ready().times(1).returning(|_, _| Ok(()));
        sink.expect_send_prompt()
            .times(1)
            .withf(|port, session_id, text| {
                *port == 4100
                    && session_id == "ses_1"
                    && text
                        == "[Inter-Job Communication from api]\n\
                            Severity: ERROR\n\
                            Finding: Endpoint removed\n\
                            File: src/routes.ts\n\
                            Line: 55\n\
                            \n\
                            Consider how this finding may affect your current work."
            })
            .returning(|_, _, _| Ok(()));
        let mut comms = JobComms::with_sink(Arc::new(sink));
        comms.relay_finding(
            "api",
            "target",
            RelayContext {
                finding: "Endpoint removed".to_string(),
                file_path: Some("src/routes.ts".to_string()),
                line_number: Some(55),
                severity: Some(Severity::Error),
            },
        );
        let job = reachable_job("target");

        // Act
        let delivered = comms.deliver_messages(&job, None).await;

        // Assert
        assert_eq!(delivered, 1);
        assert_eq!(comms.pending_messages("target"), 0);
    }

    #[tokio::test]
    async fn test_deliver_messages_returns_zero_without_port() {
        // Arrange
        let mut comms = JobComms::with_sink(Arc::new(MockPromptSink::new()));
        comms.relay_finding("api", "target", context("x"));
        let mut job = reachable_job("target");
        job.port = None;

        // Act
        let delivered = comms.deliver_messages(&job, None).await;

        // Assert
        assert_eq!(delivered, 0);
        assert_eq!(comms.pending_messages("target"), 1);
    }

    #[tokio::test]
    async fn test_failed_connection_keeps_inbox_intact() {
        // Arrange
        let mut sink = MockPromptSink::new();
        sink.expect_wait_ready()
            .times(1)
            .returning(|_, _| Err("not ready".to_string()));
        let mut comms = JobComms::with_sink(Arc::new(sink));
        comms.relay_finding("api", "target", context("x"));
        comms.relay_finding("api", "target", context("y"));
        let job = reachable_job("target");

        // Act
        let delivered = comms.deliver_messages(&job, None).await;

        // Assert
        assert_eq!(delivered, 0);
        assert_eq!(comms.pending_messages("target"), 2);
    }

    #[tokio::test]
    async fn test_filter_from_delivers_and_removes_only_matching_messages() {
        // Arrange
        let mut sink = MockPromptSink::new();
        sink.expect_wait_ready().times(1).returning(|_, _| Ok(()));
        sink.expect_send_prompt()
            .times(2)
            .withf(|_, _, text| text.contains("from api"))
            .returning(|_, _, _| Ok(()));
        let mut comms = JobComms::with_sink(Arc::new(sink));
        comms.relay_finding("api", "target", context("first"));
        comms.relay_finding("worker", "target", context("other"));
        comms.relay_finding("api", "target", context("second"));
        let job = reachable_job("target");

        // Act
        let delivered = comms.deliver_messages(&job, Some("api")).await;

        // Assert
        assert_eq!(delivered, 2);
        assert_eq!(comms.pending_messages("target"), 1);
    }

    #[tokio::test]
    async fn test_filter_excluding_everything_skips_connection() {
        // Arrange: no wait_ready expectation — connecting would panic.
        let mut comms = JobComms::with_sink(Arc::new(MockPromptSink::new()));
        comms.relay_finding("worker", "target", context("x"));
        let job = reachable_job("target");

        // Act
        let delivered = comms.deliver_messages(&job, Some("api")).await;

        // Assert
        assert_eq!(delivered, 0);
        assert_eq!(comms.pending_messages("target"), 1);
    }

    #[test]
    fn test_unregister_job_drops_inbox_and_patterns() {
        // Arrange
        let mut comms = JobComms::with_sink(Arc::new(MockPromptSink::new()));
        comms
            .register_job(&spec_with_patterns("api", &["src/**"]))
            .expect("failed to register job");
        comms.relay_finding("worker", "api", context("x"));

        // Act
        comms.unregister_job("api");

        // Assert
        assert_eq!(comms.pending_messages("api"), 0);
        assert!(!comms.should_relay_for_file("api", "src/app.ts"));
    }

    #[test]
    fn test_minimal_prompt_omits_optional_lines() {
        // Arrange
        let message = RelayMessage {
            from: "api".to_string(),
            to: "worker".to_string(),
            context: context("Schema changed"),
            timestamp: OffsetDateTime::UNIX_EPOCH,
        };

        // Act
        let prompt = format_relay_prompt(&message);

        // Assert
        assert_eq!(
            prompt,
            "[Inter-Job Communication from api]\n\
             Finding: Schema changed\n\
             \n\
             Consider how this finding may affect your current work."
        );
    }
}
