//! Job completion monitor.
//!
//! Sessions are long-lived interactive TUIs: they stream output for a
//! while, then sit waiting for input, and may never exit on their own. The
//! monitor therefore layers two completion signals per poll:
//!
//! 1. **Hard**: the multiplexer target is gone; the captured exit status
//!    decides between `completed` and `failed`.
//! 2. **Soft**: the target is alive but its capture shows the idle prompt
//!    footer and has been byte-identical across polls long enough to cross
//!    the idle threshold.
//!
//! Transient multiplexer errors are logged and never mutate job state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::job::{Job, JobPatch, JobStatus};
use crate::infra::mux::Multiplexer;
use crate::infra::state::JobStateStore;

/// Default gap between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default quiescence span treated as completion.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(300);

/// Environment flag that lifts the production floor on `poll_interval`.
pub const TEST_FAST_POLL_ENV: &str = "MISSION_CONTROL_TEST_FAST_POLL";

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Footer token the session UI shows while waiting for input.
const IDLE_FOOTER_HINT: &str = "ctrl+p commands";

/// Tokens present only while the session is still streaming.
const STREAMING_HINTS: &[&str] = &["esc interrupt"];

/// Animated glyphs the session UI cycles through while busy.
const SPINNER_GLYPHS: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// Monitor timing knobs.
#[derive(Clone, Copy, Debug)]
pub struct JobMonitorConfig {
    pub poll_interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for JobMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

/// Completion events the monitor emits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorEvent {
    Complete,
    Failed,
}

type EventHandler = Box<dyn Fn(&Job) + Send + Sync>;

/// Polls running jobs and transitions them on completion.
pub struct JobMonitor {
    config: JobMonitorConfig,
    inner: Arc<MonitorInner>,
    poll_task: Option<tokio::task::JoinHandle<()>>,
    shutdown: CancellationToken,
}

struct MonitorInner {
    complete_handlers: Mutex<Vec<EventHandler>>,
    failed_handlers: Mutex<Vec<EventHandler>>,
    idle: Mutex<HashMap<String, IdleTracker>>,
    idle_threshold: Duration,
    mux: Arc<dyn Multiplexer>,
    store: JobStateStore,
}

struct IdleTracker {
    accumulated: Duration,
    last_capture: String,
    last_poll: Instant,
}

impl JobMonitor {
    /// Creates a monitor over `store`, probing sessions through `mux`.
    ///
    /// # Errors
    /// Returns an error when `poll_interval` is below 10 s outside test
    /// mode; hammering the multiplexer faster than that buys nothing in
    /// production.
    pub fn new(
        store: JobStateStore,
        mux: Arc<dyn Multiplexer>,
        config: JobMonitorConfig,
    ) -> Result<Self, String> {
        validate_poll_interval(config.poll_interval, is_test_mode())?;

        Ok(Self {
            config,
            inner: Arc::new(MonitorInner {
                complete_handlers: Mutex::new(Vec::new()),
                failed_handlers: Mutex::new(Vec::new()),
                idle: Mutex::new(HashMap::new()),
                idle_threshold: config.idle_threshold,
                mux,
                store,
            }),
            poll_task: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Registers a handler for a monitor event.
    ///
    /// Handlers run in subscription order with the transitioned job.
    pub fn on<F>(&self, event: MonitorEvent, handler: F)
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        let handlers = match event {
            MonitorEvent::Complete => &self.inner.complete_handlers,
            MonitorEvent::Failed => &self.inner.failed_handlers,
        };
        lock_unpoisoned(handlers).push(Box::new(handler));
    }

    /// Runs an initial poll and schedules periodic polling.
    ///
    /// A second `start` while running is a no-op.
    pub fn start(&mut self) {
        if self.poll_task.is_some() {
            return;
        }

        self.shutdown = CancellationToken::new();
        let token = self.shutdown.clone();
        let inner = Arc::clone(&self.inner);
        let poll_interval = self.config.poll_interval;

        self.poll_task = Some(tokio::spawn(async move {
            inner.poll_once().await;

            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + poll_interval,
                poll_interval,
            );
            // One poll at a time: a tick that lands while the previous poll
            // still runs is skipped, never queued.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => inner.poll_once().await,
                }
            }
        }));
    }

    /// Cancels scheduled polling; an in-flight poll completes.
    ///
    /// Idempotent and safe to call before `start`.
    pub fn stop(&mut self) {
        self.shutdown.cancel();
        self.poll_task = None;
    }

    /// Returns whether periodic polling is scheduled.
    pub fn is_running(&self) -> bool {
        self.poll_task.is_some()
    }

    /// Runs one poll immediately, outside the schedule.
    pub async fn poll_now(&self) {
        self.inner.poll_once().await;
    }
}

impl Drop for JobMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MonitorInner {
    async fn poll_once(&self) {
        let jobs = match self.store.get_running_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(%error, "failed to load running jobs, skipping poll");
                return;
            }
        };

        for job in jobs {
            let running = match self
                .mux
                .is_pane_running(job.multiplexer_target.clone())
                .await
            {
                Ok(running) => running,
                Err(error) => {
                    warn!(target = %job.multiplexer_target, %error, "multiplexer probe failed");
                    continue;
                }
            };

            if running {
                self.observe_live_pane(&job).await;
            } else {
                self.handle_pane_gone(&job).await;
            }
        }
    }

    async fn handle_pane_gone(&self, job: &Job) {
        let exit_status = match self
            .mux
            .captured_exit_status(job.multiplexer_target.clone())
            .await
        {
            Ok(exit_status) => exit_status,
            Err(error) => {
                warn!(target = %job.multiplexer_target, %error, "failed to read exit status");
                None
            }
        };

        lock_unpoisoned(&self.idle).remove(&job.multiplexer_target);

        match exit_status {
            Some(code) if code != 0 => {
                self.transition(job, JobStatus::Failed, Some(code), MonitorEvent::Failed)
                    .await;
            }
            // Exit 0, or no status on record: older launchers never stored
            // one, so an unknown status still counts as a clean finish.
            other => {
                self.transition(job, JobStatus::Completed, other, MonitorEvent::Complete)
                    .await;
            }
        }
    }

    async fn observe_live_pane(&self, job: &Job) {
        let capture = match self.mux.capture_pane(job.multiplexer_target.clone()).await {
            Ok(capture) => capture,
            Err(error) => {
                warn!(target = %job.multiplexer_target, %error, "failed to capture pane");
                return;
            }
        };

        let now = Instant::now();
        let idle_for = {
            let mut trackers = lock_unpoisoned(&self.idle);
            match trackers.get_mut(&job.multiplexer_target) {
                Some(tracker) => {
                    if is_idle_snapshot(&capture) && capture == tracker.last_capture {
                        tracker.accumulated += now.saturating_duration_since(tracker.last_poll);
                    } else {
                        tracker.accumulated = Duration::ZERO;
                        tracker.last_capture = capture;
                    }
                    tracker.last_poll = now;
                    tracker.accumulated
                }
                None => {
                    trackers.insert(
                        job.multiplexer_target.clone(),
                        IdleTracker {
                            accumulated: Duration::ZERO,
                            last_capture: capture,
                            last_poll: now,
                        },
                    );
                    Duration::ZERO
                }
            }
        };

        if idle_for >= self.idle_threshold {
            debug!(
                target = %job.multiplexer_target,
                idle_ms = idle_for.as_millis(),
                "session quiescent past threshold"
            );
            lock_unpoisoned(&self.idle).remove(&job.multiplexer_target);
            self.transition(job, JobStatus::Completed, None, MonitorEvent::Complete)
                .await;
        }
    }

    async fn transition(
        &self,
        job: &Job,
        status: JobStatus,
        exit_code: Option<i32>,
        event: MonitorEvent,
    ) {
        let patch = JobPatch {
            status: Some(status),
            completed_at: Some(OffsetDateTime::now_utc()),
            exit_code,
            ..JobPatch::default()
        };

        match self.store.update_job(&job.id, &patch).await {
            Ok(updated) => self.emit(event, &updated),
            Err(error) => {
                warn!(job = %job.name, %error, "failed to persist job transition");
            }
        }
    }

    fn emit(&self, event: MonitorEvent, job: &Job) {
        let handlers = match event {
            MonitorEvent::Complete => &self.complete_handlers,
            MonitorEvent::Failed => &self.failed_handlers,
        };
        for handler in lock_unpoisoned(handlers).iter() {
            handler(job);
        }
    }
}

/// Returns whether a capture looks like a session waiting for input.
fn is_idle_snapshot(capture: &str) -> bool {
    capture.contains(IDLE_FOOTER_HINT)
        && !STREAMING_HINTS.iter().any(|hint| capture.contains(hint))
        && !capture
            .chars()
            .any(|character| SPINNER_GLYPHS.contains(&character))
}

fn validate_poll_interval(poll_interval: Duration, test_mode: bool) -> Result<(), String> {
    if poll_interval < MIN_POLL_INTERVAL && !test_mode {
        return Err(format!(
            "Poll interval must be at least {}ms, got {}ms",
            MIN_POLL_INTERVAL.as_millis(),
            poll_interval.as_millis()
        ));
    }

    Ok(())
}

fn is_test_mode() -> bool {
    std::env::var_os(TEST_FAST_POLL_ENV).is_some()
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
