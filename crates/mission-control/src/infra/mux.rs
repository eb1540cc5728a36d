//! Terminal-multiplexer command surface consumed by the job monitor.
//!
//! Only the observable commands are modeled; the multiplexer binary itself
//! is an external collaborator. The trait seam keeps the monitor testable
//! without a live `tmux` server.

use async_trait::async_trait;
use tokio::process::Command;

/// Observable multiplexer operations the monitor needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Returns whether the target session/pane still exists.
    ///
    /// # Errors
    /// Returns an error when the multiplexer binary cannot be invoked.
    async fn is_pane_running(&self, target: String) -> Result<bool, String>;

    /// Returns the recorded exit status of a finished target, when the
    /// multiplexer still knows it. `None` means no status was captured.
    ///
    /// # Errors
    /// Returns an error when the multiplexer binary cannot be invoked.
    async fn captured_exit_status(&self, target: String) -> Result<Option<i32>, String>;

    /// Captures the target's current visible terminal content.
    ///
    /// # Errors
    /// Returns an error when the capture command fails.
    async fn capture_pane(&self, target: String) -> Result<String, String>;
}

/// tmux-backed multiplexer client.
#[derive(Clone, Copy, Debug, Default)]
pub struct TmuxMultiplexer;

impl TmuxMultiplexer {
    async fn run_tmux(args: &[&str]) -> Result<std::process::Output, String> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|error| format!("Failed to execute tmux: {error}"))
    }
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn is_pane_running(&self, target: String) -> Result<bool, String> {
        // `=` pins an exact session-name match instead of tmux's default
        // prefix matching.
        let exact_target = format!("={target}");
        let output = Self::run_tmux(&["has-session", "-t", &exact_target]).await?;

        Ok(output.status.success())
    }

    async fn captured_exit_status(&self, target: String) -> Result<Option<i32>, String> {
        let output = Self::run_tmux(&[
            "display-message",
            "-p",
            "-t",
            &target,
            "#{pane_dead_status}",
        ])
        .await?;

        // A vanished target means the status was never captured; report it
        // as unknown rather than failing the poll.
        if !output.status.success() {
            return Ok(None);
        }

        let raw_status = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if raw_status.is_empty() {
            return Ok(None);
        }

        Ok(raw_status.parse::<i32>().ok())
    }

    async fn capture_pane(&self, target: String) -> Result<String, String> {
        let output = Self::run_tmux(&["capture-pane", "-p", "-t", &target]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);

            return Err(format!("Failed to capture pane {target}: {}", stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
