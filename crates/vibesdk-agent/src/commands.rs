//! Command bookkeeping: chunking constants, the "looks like a command"
//! predicate, install detection, and the dedup filter applied before
//! commands enter the agent's durable history.

pub const COMMAND_CHUNK_SIZE: usize = 5;
pub const INSTALL_COMMAND_RETRIES: u32 = 3;

/// Matches the install/add/remove/uninstall family that requires a
/// package-manifest sync afterwards.
pub fn is_install_command(command: &str) -> bool {
    command.contains("install")
        || command.contains(" add ")
        || command.contains("remove")
        || command.contains("uninstall")
}

/// Cheap sanity check before a string enters the command history: single
/// line, starts with a plausible executable token, and was not built from
/// an undefined interpolation.
pub fn looks_like_command(command: &str) -> bool {
    let trimmed = command.trim();
    if trimmed.is_empty() || trimmed.contains('\n') {
        return false;
    }
    if trimmed.contains(" undefined") || trimmed.starts_with("undefined") {
        return false;
    }
    let first = trimmed.split_whitespace().next().unwrap_or_default();
    !first.is_empty()
        && first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '_' | '-'))
}

/// Append `executed` to `history`, keeping only entries that look like
/// commands and preserving first-seen order without duplicates.
pub fn merge_history(history: &mut Vec<String>, executed: &[String]) {
    for command in executed {
        let trimmed = command.trim().to_string();
        if !looks_like_command(&trimmed) {
            continue;
        }
        if !history.contains(&trimmed) {
            history.push(trimmed);
        }
    }
}

/// Tokens of a delete command that name paths (used to drop entries from
/// the file manager alongside the sandbox `rm`).
pub fn paths_in_delete_command(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .skip(1)
        .filter(|token| !token.starts_with('-'))
        .filter(|token| token.contains('/') || token.contains('.'))
        .map(|token| token.trim_start_matches("./").to_string())
        .collect()
}
