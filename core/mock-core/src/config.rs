//! Layered rc-file configuration.
//!
//! rc files are INI-style: `[section]` headers followed by `key = value` (or
//! `key: value`) lines. Several files may be layered; later files override
//! options of the same section. Lookups take an ordered list of candidate
//! sections: the first section defining a scalar wins, while lists are
//! concatenated across every matching section.

use crate::error::{MockError, Result};
use fs_err as fs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const GENERAL_SECTION: &str = "general";
pub const COMMAND_LINE_SECTION: &str = "command line";
pub const FUNCTIONS_SECTION: &str = "functions";

/// How the engine treats requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Answer only from the loaded script.
    ReplayOnly,
    /// Forward everything to the real destination and record it.
    RecordOnly,
    /// Replay what the script knows, record the rest.
    ReplayOldRecordNew,
}

impl Mode {
    pub fn replays(self) -> bool {
        matches!(self, Mode::ReplayOnly | Mode::ReplayOldRecordNew)
    }

    pub fn records(self) -> bool {
        matches!(self, Mode::RecordOnly | Mode::ReplayOldRecordNew)
    }

    /// The mode implied by which script files were supplied.
    pub fn from_files(replay: bool, record: bool) -> Self {
        match (replay, record) {
            (true, true) => Mode::ReplayOldRecordNew,
            (true, false) => Mode::ReplayOnly,
            (false, _) => Mode::RecordOnly,
        }
    }
}

impl FromStr for Mode {
    type Err = MockError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "replay" | "replay_only" => Ok(Mode::ReplayOnly),
            "1" | "record" | "record_only" => Ok(Mode::RecordOnly),
            "2" | "mixed" | "replay_old_record_new" => Ok(Mode::ReplayOldRecordNew),
            _ => Err(MockError::InvalidMode(value.to_string())),
        }
    }
}

/// Returns the default rc file (~/.capturemock/config).
pub fn default_rc_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".capturemock").join("config"))
}

#[derive(Debug, Clone, Default)]
pub struct RcConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl RcConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads the given rc files in order. Missing files are skipped; with no
    /// files at all the default rc file is consulted.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut config = Self::empty();
        let candidates: Vec<PathBuf> = if paths.is_empty() {
            default_rc_path().into_iter().collect()
        } else {
            paths.to_vec()
        };

        for path in candidates {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "rc file not found; skipping");
                    continue;
                }
                Err(err) => return Err(MockError::io("Failed to read rc file", err)),
            };
            config.merge(&text, &path)?;
            tracing::debug!(path = %path.display(), "Loaded rc file");
        }
        Ok(config)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let mut config = Self::empty();
        config.merge(text, path)?;
        Ok(config)
    }

    fn merge(&mut self, text: &str, path: &Path) -> Result<()> {
        let malformed = |line: usize, details: &str| MockError::ConfigMalformed {
            path: path.to_path_buf(),
            line,
            details: details.to_string(),
        };

        let mut section: Option<String> = None;
        let mut last_option: Option<String> = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if raw.starts_with(char::is_whitespace) {
                let (Some(section), Some(option)) = (&section, &last_option) else {
                    return Err(malformed(line_no, "continuation line without an option"));
                };
                if let Some(value) = self
                    .sections
                    .get_mut(section)
                    .and_then(|options| options.get_mut(option))
                {
                    value.push('\n');
                    value.push_str(trimmed);
                }
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| malformed(line_no, "unterminated section header"))?
                    .trim();
                if name.is_empty() {
                    return Err(malformed(line_no, "empty section name"));
                }
                self.sections.entry(name.to_string()).or_default();
                section = Some(name.to_string());
                last_option = None;
                continue;
            }

            let Some(current) = &section else {
                return Err(malformed(line_no, "option appears before any section header"));
            };
            let split_at = trimmed
                .find(['=', ':'])
                .ok_or_else(|| malformed(line_no, "expected 'key = value'"))?;
            let key = trimmed[..split_at].trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(malformed(line_no, "empty option name"));
            }
            let value = trimmed[split_at + 1..].trim().to_string();
            self.sections
                .entry(current.clone())
                .or_default()
                .insert(key.clone(), value);
            last_option = Some(key);
        }
        Ok(())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// First value of `option` among `sections`, in order.
    pub fn lookup(&self, option: &str, sections: &[&str]) -> Option<&str> {
        let option = option.to_ascii_lowercase();
        sections.iter().find_map(|section| {
            self.sections
                .get(*section)
                .and_then(|options| options.get(&option))
                .map(String::as_str)
        })
    }

    pub fn get(&self, option: &str, sections: &[&str], default: &str) -> String {
        self.lookup(option, sections)
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_boolean(&self, option: &str, sections: &[&str], default: bool) -> Result<bool> {
        let Some(value) = self.lookup(option, sections) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            _ => Err(MockError::ConfigInvalidOption {
                section: self.defining_section(option, sections).unwrap_or_default(),
                option: option.to_string(),
                details: format!("{:?} is not a boolean", value),
            }),
        }
    }

    pub fn get_list(&self, option: &str, sections: &[&str]) -> Vec<String> {
        let option = option.to_ascii_lowercase();
        sections
            .iter()
            .filter_map(|section| {
                self.sections
                    .get(*section)
                    .and_then(|options| options.get(&option))
            })
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn get_intercepts(&self, section: &str) -> Vec<String> {
        self.get_list("intercepts", &[section])
    }

    /// Per-intercept mode override, if any section in `sections` names one.
    pub fn get_mode(&self, sections: &[&str]) -> Result<Option<Mode>> {
        self.lookup("mode", sections).map(Mode::from_str).transpose()
    }

    fn defining_section(&self, option: &str, sections: &[&str]) -> Option<String> {
        let option = option.to_ascii_lowercase();
        sections
            .iter()
            .find(|section| {
                self.sections
                    .get(**section)
                    .is_some_and(|options| options.contains_key(&option))
            })
            .map(|section| section.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> RcConfig {
        RcConfig::parse(text, Path::new("test.rc")).unwrap()
    }

    #[test]
    fn lists_concatenate_across_sections_in_order() {
        let config = parse("[default]\nintercepts=echo,ls\n\n[test1]\nintercepts=cat\n");
        assert_eq!(
            config.get_list("intercepts", &["test1", "default"]),
            vec!["cat", "echo", "ls"]
        );
    }

    #[test]
    fn first_section_wins_for_scalars() {
        let config = parse("[a]\nmode = record\n[b]\nmode = replay\n");
        assert_eq!(config.get("mode", &["b", "a"], "x"), "replay");
        assert_eq!(config.get("mode", &["missing", "a"], "x"), "record");
        assert_eq!(config.get("other", &["a", "b"], "fallback"), "fallback");
    }

    #[test]
    fn booleans_are_coerced() {
        let config = parse("[git]\nenquiry_only = Yes\nasync: off\nbroken = maybe\n");
        assert!(config.get_boolean("enquiry_only", &["git"], false).unwrap());
        assert!(!config.get_boolean("async", &["git"], true).unwrap());
        assert!(config.get_boolean("missing", &["git"], true).unwrap());
        assert!(config.get_boolean("broken", &["git"], false).is_err());
    }

    #[test]
    fn intercepts_trim_items_and_skip_empties() {
        let config = parse("[command line]\nintercepts = ls , , git\n");
        assert_eq!(config.get_intercepts("command line"), vec!["ls", "git"]);
        assert!(config.get_intercepts("functions").is_empty());
    }

    #[test]
    fn continuation_lines_extend_values() {
        let config = parse("[general]\nalterations = a{REPLACE b},\n  c{REPLACE d}\n");
        assert_eq!(
            config.get_list("alterations", &["general"]),
            vec!["a{REPLACE b}", "c{REPLACE d}"]
        );
    }

    #[test]
    fn comments_are_ignored_and_keys_are_case_insensitive() {
        let config = parse("# leading comment\n[ls]\n; note\nMODE = mixed\n");
        assert_eq!(
            config.get_mode(&["ls"]).unwrap(),
            Some(Mode::ReplayOldRecordNew)
        );
    }

    #[test]
    fn malformed_lines_report_their_position() {
        let err = RcConfig::parse("[ok]\nthis line has no separator\n", Path::new("x.rc"))
            .unwrap_err();
        match err {
            MockError::ConfigMalformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(RcConfig::parse("key = value\n", Path::new("x.rc")).is_err());
        assert!(RcConfig::parse("[unterminated\n", Path::new("x.rc")).is_err());
    }

    #[test]
    fn later_files_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.rc");
        let second = dir.path().join("second.rc");
        std::fs::write(&first, "[ls]\nmode = record\nintercepts = a\n").unwrap();
        std::fs::write(&second, "[ls]\nmode = replay\n").unwrap();
        let missing = dir.path().join("missing.rc");

        let config = RcConfig::load(&[first, missing, second]).unwrap();
        assert_eq!(config.get_mode(&["ls"]).unwrap(), Some(Mode::ReplayOnly));
        assert_eq!(config.get_list("intercepts", &["ls"]), vec!["a"]);
    }

    #[test]
    fn modes_parse_from_names_and_numbers() {
        assert_eq!("0".parse::<Mode>().unwrap(), Mode::ReplayOnly);
        assert_eq!("Record".parse::<Mode>().unwrap(), Mode::RecordOnly);
        assert_eq!("2".parse::<Mode>().unwrap(), Mode::ReplayOldRecordNew);
        assert!("sometimes".parse::<Mode>().is_err());
        assert_eq!(Mode::from_files(true, true), Mode::ReplayOldRecordNew);
        assert_eq!(Mode::from_files(false, false), Mode::RecordOnly);
    }
}
