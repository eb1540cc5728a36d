//! Git child-process invocation and in-process serialization.

pub mod invoker;
pub mod mutex;

pub use invoker::{
    GitOutput, branch_exists, git_command, parse_conflict_files, resolve_default_branch, rev_parse,
};
pub(crate) use invoker::conflict_files_from;
pub use mutex::{GitLockGuard, GitMutex};
