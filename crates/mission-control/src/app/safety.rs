//! Safety screening for post-create shell commands.
//!
//! Hooks run arbitrary user-supplied commands inside fresh worktrees; this
//! validator flags the obviously destructive shapes before execution.
//! Screening is lexical, not a sandbox: a command that passes is merely
//! unsuspicious.

/// Verdict for one screened command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandSafety {
    pub safe: bool,
    /// One entry per matched dangerous pattern.
    pub warnings: Vec<String>,
}

/// One command paired with its verdict, as returned by [`validate_commands`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandValidation {
    pub command: String,
    pub result: CommandSafety,
}

/// Tool prefixes considered safe with ordinary arguments.
const SAFE_COMMAND_PREFIXES: &[&str] = &[
    "npm", "npx", "bun", "bunx", "yarn", "pnpm", "pip", "pip3", "cargo", "make", "go", "dotnet",
    "composer", "bundle", "gem", "mix", "poetry", "cmake",
];

const SHELL_INTERPRETERS: &[&str] = &["sh", "bash", "zsh"];

/// Screens one command and reports whether it is safe to run.
pub fn validate_command(command: &str) -> CommandSafety {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return CommandSafety {
            safe: false,
            warnings: vec!["empty command".to_string()],
        };
    }

    let mut warnings = Vec::new();

    if trimmed.contains('`') {
        warnings.push("backtick command substitution".to_string());
    }
    if trimmed.contains("$(") {
        warnings.push("dollar-paren command substitution".to_string());
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.iter().any(|token| *token == "eval") {
        warnings.push("eval execution".to_string());
    }
    if tokens.iter().any(|token| *token == "exec") {
        warnings.push("exec execution".to_string());
    }

    let pipe_segments: Vec<&str> = trimmed.split('|').map(str::trim).collect();
    let has_pipe = pipe_segments.len() > 1;
    let mut pipe_captured = false;
    if has_pipe {
        let pipes_to_shell = pipe_segments.iter().skip(1).any(|segment| {
            segment
                .split_whitespace()
                .next()
                .is_some_and(|first| SHELL_INTERPRETERS.contains(&first))
        });
        if pipes_to_shell {
            warnings.push("pipe to shell interpreter".to_string());
            pipe_captured = true;
        }

        let downloads_into_pipe = pipe_segments
            .first()
            .and_then(|segment| segment.split_whitespace().next())
            .is_some_and(|first| first == "curl" || first == "wget");
        if downloads_into_pipe {
            warnings.push("remote script piped to another command".to_string());
            pipe_captured = true;
        }
    }

    warnings.extend(rm_warnings(&tokens));

    if redirects_into_etc(trimmed) {
        warnings.push("redirect to /etc/".to_string());
    }

    if trimmed.contains(';') {
        warnings.push("semicolon-chained commands".to_string());
    }
    if trimmed.contains("&&") {
        warnings.push("chained commands (&&)".to_string());
    }
    if has_pipe && !pipe_captured {
        warnings.push("pipe operator".to_string());
    }

    if !warnings.is_empty() {
        return CommandSafety {
            safe: false,
            warnings,
        };
    }

    let first_token = tokens.first().copied().unwrap_or_default();
    if SAFE_COMMAND_PREFIXES.contains(&first_token) {
        return CommandSafety {
            safe: true,
            warnings,
        };
    }

    // A bare command name with no arguments and no metacharacters gets the
    // benefit of the doubt.
    if tokens.len() == 1 && !has_metacharacters(trimmed) {
        return CommandSafety {
            safe: true,
            warnings,
        };
    }

    CommandSafety {
        safe: false,
        warnings: vec![format!("unknown command: {first_token}")],
    }
}

/// Screens a list of commands, returning a parallel list of verdicts.
pub fn validate_commands(commands: &[String]) -> Vec<CommandValidation> {
    commands
        .iter()
        .map(|command| CommandValidation {
            command: command.clone(),
            result: validate_command(command),
        })
        .collect()
}

fn rm_warnings(tokens: &[&str]) -> Vec<String> {
    let mut warnings = Vec::new();
    let Some((first, rest)) = tokens.split_first() else {
        return warnings;
    };
    if *first != "rm" {
        return warnings;
    }

    let mut recursive = false;
    let mut force = false;
    let mut targets = Vec::new();
    for token in rest {
        if let Some(flags) = token.strip_prefix('-') {
            recursive |= flags.contains('r') || flags.contains('R');
            force |= flags.contains('f');
        } else {
            targets.push(*token);
        }
    }

    if !(recursive && force) {
        return warnings;
    }

    if targets.iter().any(|target| *target == "/") {
        warnings.push("rm -rf /".to_string());
    } else if targets.iter().any(|target| target.starts_with('/')) {
        warnings.push("delete from root".to_string());
    }

    warnings
}

fn redirects_into_etc(command: &str) -> bool {
    let mut rest = command;
    while let Some(index) = rest.find('>') {
        let after = rest[index..].trim_start_matches('>').trim_start();
        if after.starts_with("/etc/") {
            return true;
        }
        rest = &rest[index + 1..];
    }

    false
}

fn has_metacharacters(command: &str) -> bool {
    command
        .chars()
        .any(|character| matches!(character, '|' | ';' | '&' | '<' | '>' | '$' | '`'))
}
