//! HTTP client for a job session's embedded server.
//!
//! Every launched session exposes a local API at `http://127.0.0.1:<port>`
//! (optionally behind HTTP Basic auth as user `opencode`). This module owns
//! only the client side: a readiness probe with exponential backoff and
//! fire-and-forget prompt delivery.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tokio::time::Instant;

/// Default deadline for [`wait_for_server`].
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(60);

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: f64 = 1.5;
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Options for [`wait_for_server`].
#[derive(Clone, Debug)]
pub struct WaitForServerOptions {
    pub timeout: Duration,
    pub password: Option<String>,
}

impl Default for WaitForServerOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SERVER_TIMEOUT,
            password: None,
        }
    }
}

/// Client bound to one session's local HTTP server.
#[derive(Clone, Debug)]
pub struct JobClient {
    auth_header: Option<String>,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct CreatedSession {
    id: String,
}

/// Constructs a client for `http://127.0.0.1:<port>`.
///
/// When a password is given, requests carry
/// `Authorization: Basic base64("opencode:" + password)`.
pub fn create_job_client(port: u16, password: Option<&str>) -> JobClient {
    JobClient {
        auth_header: password.map(basic_auth_header),
        base_url: format!("http://127.0.0.1:{port}"),
        http: reqwest::Client::new(),
    }
}

/// Polls the session-list endpoint until the server answers or the deadline
/// expires.
///
/// Backoff starts at 100 ms, grows by 1.5x per attempt, and is capped at
/// 5 s.
///
/// # Errors
/// Returns a "server not ready" error when the deadline expires first.
pub async fn wait_for_server(
    port: u16,
    options: WaitForServerOptions,
) -> Result<JobClient, String> {
    let client = create_job_client(port, options.password.as_deref());
    let deadline = Instant::now() + options.timeout;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if client.list_sessions().await.is_ok() {
            return Ok(client);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(format!(
                "Server not ready on port {port} after {}ms",
                options.timeout.as_millis()
            ));
        }

        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = next_backoff(backoff);
    }
}

/// Sends an asynchronous prompt to a session; returns once accepted.
///
/// # Errors
/// Returns an error when the request fails or the server rejects it.
pub async fn send_prompt(
    client: &JobClient,
    session_id: &str,
    text: &str,
    agent: Option<&str>,
    model: Option<&str>,
) -> Result<(), String> {
    client
        .prompt_async(session_id, text, agent, model)
        .await
        .map_err(|error| format!("Failed to send prompt: {error}"))
}

/// Creates a fresh session and sends it one prompt.
///
/// # Errors
/// Returns an error when session creation or prompt delivery fails.
pub async fn create_session_and_prompt(
    client: &JobClient,
    text: &str,
    agent: Option<&str>,
    model: Option<&str>,
) -> Result<String, String> {
    let session_id = client.create_session().await?;
    send_prompt(client, &session_id, text, agent, model).await?;

    Ok(session_id)
}

impl JobClient {
    /// Probes the server by listing sessions.
    ///
    /// # Errors
    /// Returns an error when the server is unreachable or answers with a
    /// non-success status.
    pub async fn list_sessions(&self) -> Result<(), String> {
        let response = self
            .request(reqwest::Method::GET, "/session")
            .send()
            .await
            .map_err(|error| format!("Failed to reach session server: {error}"))?;

        if !response.status().is_success() {
            return Err(format!(
                "Session server answered with status {}",
                response.status()
            ));
        }

        Ok(())
    }

    /// Creates a new session and returns its id.
    ///
    /// # Errors
    /// Returns an error when the request fails or the response is not a
    /// session document.
    pub async fn create_session(&self) -> Result<String, String> {
        let response = self
            .request(reqwest::Method::POST, "/session")
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|error| format!("Failed to create session: {error}"))?;

        if !response.status().is_success() {
            return Err(format!(
                "Failed to create session: status {}",
                response.status()
            ));
        }

        let created: CreatedSession = response
            .json()
            .await
            .map_err(|error| format!("Failed to parse created session: {error}"))?;

        Ok(created.id)
    }

    async fn prompt_async(
        &self,
        session_id: &str,
        text: &str,
        agent: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), String> {
        let mut body = serde_json::json!({
            "parts": [{ "type": "text", "text": text }],
        });
        if let Some(agent) = agent {
            body["agent"] = serde_json::Value::String(agent.to_string());
        }
        if let Some(model) = model {
            body["model"] = serde_json::Value::String(model.to_string());
        }

        let path = format!("/session/{session_id}/message");
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&body)
            .send()
            .await
            .map_err(|error| error.to_string())?;

        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(auth_header) = &self.auth_header {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth_header.clone());
        }

        builder
    }
}

/// Narrow delivery seam used by the relay bus, mockable in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PromptSink: Send + Sync {
    /// Waits until the session server on `port` answers.
    ///
    /// # Errors
    /// Returns an error when the deadline expires first.
    async fn wait_ready(&self, port: u16, timeout: Duration) -> Result<(), String>;

    /// Sends one prompt to a session on `port`.
    ///
    /// # Errors
    /// Returns an error when delivery fails.
    async fn send_prompt(
        &self,
        port: u16,
        session_id: String,
        text: String,
    ) -> Result<(), String>;
}

/// [`PromptSink`] backed by the real HTTP client.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpPromptSink;

#[async_trait]
impl PromptSink for HttpPromptSink {
    async fn wait_ready(&self, port: u16, timeout: Duration) -> Result<(), String> {
        wait_for_server(
            port,
            WaitForServerOptions {
                timeout,
                password: None,
            },
        )
        .await
        .map(|_client| ())
    }

    async fn send_prompt(
        &self,
        port: u16,
        session_id: String,
        text: String,
    ) -> Result<(), String> {
        let client = create_job_client(port, None);
        send_prompt(&client, &session_id, &text, None, None).await
    }
}

fn basic_auth_header(password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("opencode:{password}")))
}

fn next_backoff(current: Duration) -> Duration {
    current.mul_f64(BACKOFF_FACTOR).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header_uses_opencode_user() {
        // Arrange
        let password = "s3cret";

        // Act
        let header = basic_auth_header(password);

        // Assert
        let encoded = header
            .strip_prefix("Basic ")
            .expect("header should be Basic");
        let decoded = BASE64.decode(encoded).expect("header should be base64");
        assert_eq!(decoded, b"opencode:s3cret");
    }

    #[test]
    fn test_next_backoff_grows_and_caps_at_five_seconds() {
        // Arrange
        let mut backoff = INITIAL_BACKOFF;

        // Act
        let mut observed = Vec::new();
        for _ in 0..12 {
            observed.push(backoff);
            backoff = next_backoff(backoff);
        }

        // Assert
        assert_eq!(observed[0], Duration::from_millis(100));
        assert_eq!(observed[1], Duration::from_millis(150));
        assert_eq!(observed[2], Duration::from_millis(225));
        assert!(observed.iter().all(|delay| *delay <= MAX_BACKOFF));
        assert_eq!(backoff, MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_wait_for_server_fails_after_deadline() {
        // Arrange: grab a port nothing listens on.
        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind probe port");
        let port = listener
            .local_addr()
            .expect("failed to read local addr")
            .port();
        drop(listener);

        // Act
        let result = wait_for_server(
            port,
            WaitForServerOptions {
                timeout: Duration::from_millis(300),
                password: None,
            },
        )
        .await;

        // Assert
        let error = result.err().expect("wait should time out");
        assert!(error.contains("not ready"), "unexpected error: {error}");
    }
}
