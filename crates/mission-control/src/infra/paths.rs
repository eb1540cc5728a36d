//! Data-directory layout and managed-worktree detection.
//!
//! All orchestrator-owned worktrees live under
//! `${XDG_DATA_HOME:-~/.local/share}/opencode-mission-control/<project>/…`,
//! one directory per project, one subdirectory per job (or integration
//! branch) under it.

use std::path::{Path, PathBuf};

/// Directory name under the platform data root that holds all projects.
pub const DATA_DIR_NAME: &str = "opencode-mission-control";

/// Result of probing whether a path belongs to an orchestrator worktree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ManagedWorktree {
    pub is_managed: bool,
    /// Root of the managed worktree the path sits in.
    pub worktree_path: Option<PathBuf>,
    /// First path segment under the project directory.
    pub job_name: Option<String>,
}

/// Returns the orchestrator data root.
///
/// Honors `$XDG_DATA_HOME`, falling back to `~/.local/share`.
pub fn data_root() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(DATA_DIR_NAME)
}

/// Derives a stable, human-readable project identifier from a repository
/// root: the directory name slug plus a hash of the absolute path, so two
/// checkouts with the same name do not collide.
pub fn project_id(repo_root: &Path) -> String {
    let slug = repo_root
        .file_name()
        .map(|name| slugify(&name.to_string_lossy()))
        .filter(|slug| !slug.is_empty())
        .unwrap_or_else(|| "repo".to_string());
    let hash = path_fingerprint(repo_root);
    let folded = (hash ^ (hash >> 32)) & u64::from(u32::MAX);

    format!("{slug}-{folded:08x}")
}

/// Returns the per-project directory under the data root.
pub fn project_dir(repo_root: &Path) -> PathBuf {
    data_root().join(project_id(repo_root))
}

/// Reports whether `path` lies inside an orchestrator-managed worktree.
pub fn is_in_managed_worktree(path: &Path) -> ManagedWorktree {
    managed_worktree_under(&data_root(), path)
}

fn managed_worktree_under(data_root: &Path, path: &Path) -> ManagedWorktree {
    let Ok(relative) = path.strip_prefix(data_root) else {
        return ManagedWorktree::default();
    };

    let mut components = relative
        .components()
        .filter_map(|component| match component {
            std::path::Component::Normal(segment) => Some(segment.to_os_string()),
            _ => None,
        });
    let Some(project_segment) = components.next() else {
        return ManagedWorktree::default();
    };
    let Some(job_segment) = components.next() else {
        return ManagedWorktree::default();
    };

    ManagedWorktree {
        is_managed: true,
        worktree_path: Some(data_root.join(&project_segment).join(&job_segment)),
        job_name: Some(job_segment.to_string_lossy().into_owned()),
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() {
                character.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    slug.trim_matches('-').to_string()
}

/// FNV-1a over the lossy UTF-8 form of the path. Stable across runs and
/// platforms, unlike the std hasher.
fn path_fingerprint(path: &Path) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in path.to_string_lossy().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }

    hash
}
