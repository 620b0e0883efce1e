//! Name validation shared by streams, groups, topics and event types.

use std::sync::OnceLock;

use regex::Regex;

/// Maximum length of any stream, group, consumer or topic name
pub const MAX_NAME_LEN: usize = 128;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static name pattern"))
}

/// Returns true if `name` is non-empty, short enough and only uses
/// alphanumerics, dots, dashes and underscores.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && name_pattern().is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("finbot.events"));
        assert!(is_valid_name("finbot-consumers"));
        assert!(is_valid_name("tx_created.v2"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("../etc/passwd"));
        assert!(!is_valid_name("finbot:accounts"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(&"x".repeat(MAX_NAME_LEN + 1)));
    }
}
