//! Owner identity handling - normalize and validate chat handles

use crate::config::IDENTITY_SIGIL;
use once_cell::sync::Lazy;
use regex::Regex;

/// Normalized handle: sigil followed by 1-32 of `[a-z0-9_]`
static IDENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@[a-z0-9_]{1,32}$").expect("Invalid identity regex"));

/// Link prefixes people paste instead of a bare handle
const LINK_PREFIXES: &[&str] = &["https://t.me/", "http://t.me/", "t.me/"];

/// Normalize a chat handle to canonical `@lowercase` form
pub fn normalize_identity(raw: &str) -> String {
    let mut handle = raw.trim().to_lowercase();

    for prefix in LINK_PREFIXES {
        if let Some(rest) = handle.strip_prefix(prefix) {
            handle = rest.to_string();
            break;
        }
    }

    let bare = handle.trim_start_matches(IDENTITY_SIGIL);
    format!("{}{}", IDENTITY_SIGIL, bare)
}

/// Check an already-normalized identity against the handle format
pub fn is_valid_identity(normalized: &str) -> bool {
    IDENTITY_PATTERN.is_match(normalized)
}

/// Normalize and validate in one step
pub fn parse_identity(raw: &str) -> Option<String> {
    let normalized = normalize_identity(raw);
    is_valid_identity(&normalized).then_some(normalized)
}

/// Compare a message sender against the expected owner
pub fn same_identity(sender: &str, owner: &str) -> bool {
    !sender.trim().is_empty() && normalize_identity(sender) == owner
}
