//! Post-create hook resolution.
//!
//! Worktree setup actions come from two places: project-level config
//! defaults and per-job overrides. This resolver composes the two into one
//! sanitized hook before anything touches the filesystem. Entries must stay
//! inside the worktree: absolute paths and `..` segments never survive
//! resolution.

use std::path::{Component, Path};

use crate::domain::plan::PostCreateHook;

/// Directory that is always symlinked into every managed worktree so
/// sessions share authentication and settings with the main checkout.
pub const PINNED_SYMLINK_DIR: &str = ".opencode";

/// Composes config defaults with per-job overrides into one runnable hook.
///
/// Rules: entries are deduplicated after trailing slashes are stripped; an
/// absolute or `..`-containing entry in `copy_files` discards the whole
/// copy list, while such entries in `symlink_dirs` are dropped
/// individually; `.opencode` is always present in `symlink_dirs`; commands
/// from the defaults run before commands from the overrides.
pub fn resolve_post_create_hook(
    defaults: Option<&PostCreateHook>,
    overrides: Option<&PostCreateHook>,
) -> PostCreateHook {
    let copy_files = merge_entries(
        defaults.map(|hook| hook.copy_files.as_slice()),
        overrides.map(|hook| hook.copy_files.as_slice()),
    );
    let copy_files = if copy_files.iter().any(|entry| is_escaping_path(entry)) {
        Vec::new()
    } else {
        copy_files
    };

    let mut symlink_dirs: Vec<String> = merge_entries(
        defaults.map(|hook| hook.symlink_dirs.as_slice()),
        overrides.map(|hook| hook.symlink_dirs.as_slice()),
    )
    .into_iter()
    .filter(|entry| !is_escaping_path(entry))
    .collect();
    if !symlink_dirs.iter().any(|entry| entry == PINNED_SYMLINK_DIR) {
        symlink_dirs.push(PINNED_SYMLINK_DIR.to_string());
    }

    let commands = merge_entries(
        defaults.map(|hook| hook.commands.as_slice()),
        overrides.map(|hook| hook.commands.as_slice()),
    );

    PostCreateHook {
        copy_files,
        symlink_dirs,
        commands,
    }
}

/// Concatenates defaults before overrides, normalizing and deduplicating.
fn merge_entries(defaults: Option<&[String]>, overrides: Option<&[String]>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for entry in defaults
        .unwrap_or_default()
        .iter()
        .chain(overrides.unwrap_or_default())
    {
        let normalized = entry.trim_end_matches('/');
        if normalized.is_empty() {
            continue;
        }
        if !merged.iter().any(|existing| existing == normalized) {
            merged.push(normalized.to_string());
        }
    }

    merged
}

/// Returns whether a hook entry could escape the worktree.
fn is_escaping_path(entry: &str) -> bool {
    let path = Path::new(entry);

    path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(copy: &[&str], symlink: &[&str], commands: &[&str]) -> PostCreateHook {
        PostCreateHook {
            copy_files: copy.iter().map(ToString::to_string).collect(),
            symlink_dirs: symlink.iter().map(ToString::to_string).collect(),
            commands: commands.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_resolution_is_idempotent_for_equal_inputs() {
        // Arrange
        let defaults = hook(&[".env"], &["node_modules/"], &["npm install"]);

        // Act
        let doubled = resolve_post_create_hook(Some(&defaults), Some(&defaults));
        let single = resolve_post_create_hook(Some(&defaults), None);

        // Assert
        assert_eq!(doubled, single);
    }

    #[test]
    fn test_opencode_is_always_symlinked() {
        // Arrange / Act
        let empty = resolve_post_create_hook(None, None);
        let explicit = resolve_post_create_hook(Some(&hook(&[], &[".opencode/"], &[])), None);

        // Assert
        assert_eq!(empty.symlink_dirs, vec![PINNED_SYMLINK_DIR.to_string()]);
        assert_eq!(explicit.symlink_dirs, vec![PINNED_SYMLINK_DIR.to_string()]);
    }

    #[test]
    fn test_trailing_slashes_are_stripped_before_dedup() {
        // Arrange
        let defaults = hook(&[".env"], &["vendor/"], &[]);
        let overrides = hook(&[".env/"], &["vendor"], &[]);

        // Act
        let resolved = resolve_post_create_hook(Some(&defaults), Some(&overrides));

        // Assert
        assert_eq!(resolved.copy_files, vec![".env".to_string()]);
        assert_eq!(
            resolved.symlink_dirs,
            vec!["vendor".to_string(), PINNED_SYMLINK_DIR.to_string()]
        );
    }

    #[test]
    fn test_escaping_copy_entry_discards_whole_copy_list() {
        // Arrange
        let defaults = hook(&[".env", "../secrets"], &[], &[]);

        // Act
        let resolved = resolve_post_create_hook(Some(&defaults), None);

        // Assert
        assert!(resolved.copy_files.is_empty());
    }

    #[test]
    fn test_escaping_symlink_entries_are_dropped_individually() {
        // Arrange
        let defaults = hook(&[], &["node_modules", "/etc", "nested/../up"], &[]);

        // Act
        let resolved = resolve_post_create_hook(Some(&defaults), None);

        // Assert
        assert_eq!(
            resolved.symlink_dirs,
            vec!["node_modules".to_string(), PINNED_SYMLINK_DIR.to_string()]
        );
    }

    #[test]
    fn test_default_commands_run_before_override_commands() {
        // Arrange
        let defaults = hook(&[], &[], &["npm install"]);
        let overrides = hook(&[], &[], &["npm run build", "npm install"]);

        // Act
        let resolved = resolve_post_create_hook(Some(&defaults), Some(&overrides));

        // Assert
        assert_eq!(
            resolved.commands,
            vec!["npm install".to_string(), "npm run build".to_string()]
        );
    }
}
