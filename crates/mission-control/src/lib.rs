//! Mission Control core: orchestrates parallel AI coding jobs.
//!
//! Each job runs an interactive coding session inside an isolated git
//! worktree. The [`app::monitor::JobMonitor`] watches those sessions for
//! completion, finished branches are merged through the serialized,
//! test-gated [`app::merge_train::MergeTrain`] on a throwaway integration
//! branch, and jobs exchange findings through the [`app::relay::JobComms`]
//! bus which forwards into live sessions over their local HTTP side-channel.
//!
//! The CLI/TUI front-end, configuration loading, and telemetry setup live in
//! the embedding application; this crate only exposes the typed core.

pub mod app;
pub mod domain;
pub mod infra;
