//! Prompt text utilities
//!
//! Shared predicates and normalization used by detection, scoring, and the
//! session readers: deciding whether a user message is a real prompt,
//! recognizing slash commands, and computing the fingerprint that keys the
//! scoring cache and sync dedup.

use sha2::{Digest, Sha256};

/// A recognized slash command, split into name and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    /// Command name without the leading `/` (may contain `:` segments)
    pub name: String,
    /// Everything after the first whitespace, trimmed; empty if none
    pub arguments: String,
}

/// Whether a user message is an actual prompt typed by a human.
///
/// Returns false for empty/whitespace strings and for tool-result markers:
/// a string whose leading `[Tool ... ]` bracket swallows all of its content.
pub fn is_actual_user_prompt(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }

    if let Some(rest) = trimmed.strip_prefix("[Tool") {
        match rest.find(']') {
            // Content after the closing bracket makes it a real prompt
            Some(close) => !rest[close + 1..].trim().is_empty(),
            // Unterminated marker, treat as fully bracketed
            None => false,
        }
    } else {
        true
    }
}

/// Detect a slash command: `/` followed by a letter, then letters, digits,
/// `_`, `:`, or `-`. Namespaced names like `/review:pr` are allowed.
///
/// Rejects `/`, `//x`, `/ x`, and names starting with a digit, hyphen, or
/// underscore.
pub fn detect_slash_command(text: &str) -> Option<SlashCommand> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;

    let mut chars = rest.char_indices();
    let (_, first) = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }

    let mut name_end = rest.len();
    for (i, c) in chars {
        if c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '-' {
            continue;
        }
        name_end = i;
        break;
    }

    let name = &rest[..name_end];
    let tail = &rest[name_end..];

    // A non-whitespace character ending the name (e.g. "/foo!bar") is not a
    // command boundary we recognize
    if !tail.is_empty() && !tail.starts_with(char::is_whitespace) {
        return None;
    }

    Some(SlashCommand {
        name: name.to_string(),
        arguments: tail.trim().to_string(),
    })
}

/// Whether the text is purely a slash command (no way to score it).
pub fn is_slash_command(text: &str) -> bool {
    detect_slash_command(text).is_some()
}

/// Normalize prompt text for fingerprinting: trim and collapse internal
/// whitespace runs to single spaces.
pub fn normalize_prompt(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical fingerprint of a prompt: sha256 of the normalized text, hex.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(text).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_actual_user_prompt_rejects_empty() {
        assert!(!is_actual_user_prompt(""));
        assert!(!is_actual_user_prompt("   "));
        assert!(!is_actual_user_prompt("\n\t"));
    }

    #[test]
    fn test_is_actual_user_prompt_rejects_tool_markers() {
        assert!(!is_actual_user_prompt("[Tool result]"));
        assert!(!is_actual_user_prompt("[Tool: Bash exit 0]"));
        assert!(!is_actual_user_prompt("  [Tool use in progress"));
    }

    #[test]
    fn test_is_actual_user_prompt_accepts_real_prompts() {
        assert!(is_actual_user_prompt("fix the login bug"));
        assert!(is_actual_user_prompt("[Tool: Read] now explain the output"));
        // Brackets not starting with [Tool are just text
        assert!(is_actual_user_prompt("[urgent] fix this"));
    }

    #[test]
    fn test_detect_slash_command_accepts() {
        assert_eq!(
            detect_slash_command("/x"),
            Some(SlashCommand {
                name: "x".to_string(),
                arguments: String::new(),
            })
        );
        assert_eq!(
            detect_slash_command("/commit -m fix"),
            Some(SlashCommand {
                name: "commit".to_string(),
                arguments: "-m fix".to_string(),
            })
        );
        assert_eq!(
            detect_slash_command("  /review:pr 42  "),
            Some(SlashCommand {
                name: "review:pr".to_string(),
                arguments: "42".to_string(),
            })
        );
    }

    #[test]
    fn test_detect_slash_command_rejects() {
        assert_eq!(detect_slash_command("/"), None);
        assert_eq!(detect_slash_command("//x"), None);
        assert_eq!(detect_slash_command("/ x"), None);
        assert_eq!(detect_slash_command("/123x"), None);
        assert_eq!(detect_slash_command("/-x"), None);
        assert_eq!(detect_slash_command("/_x"), None);
        assert_eq!(detect_slash_command("not a command"), None);
    }

    #[test]
    fn test_normalize_prompt() {
        assert_eq!(normalize_prompt(" Fix  bug "), "Fix bug");
        assert_eq!(normalize_prompt("a\n\tb   c"), "a b c");
        assert_eq!(normalize_prompt(""), "");
    }

    #[test]
    fn test_fingerprint_equal_after_normalization() {
        assert_eq!(fingerprint("Fix bug"), fingerprint(" Fix  bug "));
        assert_ne!(fingerprint("Fix bug"), fingerprint("fix bug"));
        assert_eq!(fingerprint("x").len(), 64);
    }
}
