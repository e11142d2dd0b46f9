//! Compiled regex patterns for scripts, alterations and replay items.
//!
//! These patterns are compiled once on first use and reused for every
//! request the server handles.

use once_cell::sync::Lazy;
use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Script Parsing Regexes
// ═══════════════════════════════════════════════════════════════════════════════

/// `<-[12]CMD:payload` or `->OUT:payload`.
pub static RE_SCRIPT_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(<-|->)(?:\[(\d+)\])?([A-Z]{3}):").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration Regexes
// ═══════════════════════════════════════════════════════════════════════════════

/// `pattern{REPLACE replacement}`
pub static RE_ALTERATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(.*)\{REPLACE (.*)\}$").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Replay Item Regexes
// ═══════════════════════════════════════════════════════════════════════════════

/// Matches a recorded command line whose program is `command`, with or
/// without a leading directory and an `env ...` prefix.
pub fn command_item(command: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r#"^<-(?:\[\d+\])?CMD:(?:env .*)?\[u?['"](?:[^'"]*[/\\])?{}['"]"#,
        regex::escape(command)
    ))
}

/// Matches a recorded function call on `function` or any attribute below it.
pub fn function_item(function: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"^<-(?:\[\d+\])?FNC:{}[.(]",
        regex::escape(function)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_entry_captures_marker_number_and_tag() {
        let caps = RE_SCRIPT_ENTRY.captures("<-[7]CMD:['ls']").unwrap();
        assert_eq!(&caps[1], "<-");
        assert_eq!(&caps[2], "7");
        assert_eq!(&caps[3], "CMD");

        let caps = RE_SCRIPT_ENTRY.captures("->OUT:text").unwrap();
        assert!(caps.get(2).is_none());
        assert!(!RE_SCRIPT_ENTRY.is_match("plain continuation"));
    }

    #[test]
    fn alteration_splits_pattern_and_replacement() {
        let caps = RE_ALTERATION.captures(r"\d+ms{REPLACE <time>}").unwrap();
        assert_eq!(&caps[1], r"\d+ms");
        assert_eq!(&caps[2], "<time>");
        assert!(RE_ALTERATION.captures("no replacement here").is_none());
    }

    #[test]
    fn command_items_match_program_position_only() {
        let ls = command_item("ls").unwrap();
        assert!(ls.is_match("<-CMD:['ls','-l']"));
        assert!(ls.is_match("<-[3]CMD:['/bin/ls']"));
        assert!(ls.is_match("<-CMD:env 'LANG=C' ['ls']"));
        assert!(!ls.is_match("<-CMD:['echo','ls']"));
        assert!(!ls.is_match("<-CMD:['lsof']"));
    }

    #[test]
    fn function_items_match_dotted_attributes() {
        let clock = function_item("clock").unwrap();
        assert!(clock.is_match("<-FNC:clock.now()"));
        assert!(clock.is_match("<-FNC:clock(1)"));
        assert!(!clock.is_match("<-FNC:clockwork.now()"));
    }
}
