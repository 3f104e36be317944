//! Line-record model of a settings file.
//!
//! A file is an ordered list of blank, comment and assignment lines. Edits
//! rewrite matching assignment records in place and append the rest, so
//! untouched lines and comments survive byte for byte.

use crate::settings::SettingsMap;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Blank(String),
    Comment(String),
    Assignment { key: String, raw: String },
    /// Anything else (no `=`), kept verbatim.
    Other(String),
}

impl Line {
    fn raw(&self) -> &str {
        match self {
            Line::Blank(s) | Line::Comment(s) | Line::Other(s) => s,
            Line::Assignment { raw, .. } => raw,
        }
    }
}

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*=").expect("static assignment pattern")
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsDocument {
    lines: Vec<Line>,
}

impl SettingsDocument {
    pub fn from_text(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    Line::Blank(line.to_string())
                } else if trimmed.starts_with('#') {
                    Line::Comment(line.to_string())
                } else if let Some(caps) = assignment_re().captures(line) {
                    Line::Assignment {
                        key: caps[1].to_string(),
                        raw: line.to_string(),
                    }
                } else {
                    Line::Other(line.to_string())
                }
            })
            .collect();
        Self { lines }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lines
            .iter()
            .any(|l| matches!(l, Line::Assignment { key: k, .. } if k == key))
    }

    /// Replace every assignment of `key`, or append one if there is none.
    pub fn upsert(&mut self, key: &str, value: &str) {
        let rendered = format!("{}={}", key, quote_value(value));
        let mut found = false;
        for line in &mut self.lines {
            if let Line::Assignment { key: k, raw } = line {
                if k == key {
                    *raw = rendered.clone();
                    found = true;
                }
            }
        }
        if !found {
            self.lines.push(Line::Assignment {
                key: key.to_string(),
                raw: rendered,
            });
        }
    }

    /// Key/value view with comments and quotes stripped.
    pub fn to_map(&self) -> SettingsMap {
        let mut out = SettingsMap::new();
        for line in &self.lines {
            if let Line::Assignment { raw, .. } = line {
                if let Some((key, value)) = parse_assignment(raw) {
                    out.insert(key, value);
                }
            }
        }
        out
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line.raw());
            out.push('\n');
        }
        out
    }
}

/// Parse settings text into a map.
///
/// Blank and `#` lines are skipped, each line is split on the first `=`,
/// inline comments and surrounding quotes are stripped, and a later
/// duplicate key overwrites an earlier one.
pub fn parse_settings(text: &str) -> SettingsMap {
    SettingsDocument::from_text(text).to_map()
}

/// Render a map as settings text, one assignment per line.
pub fn serialize_settings(map: &SettingsMap) -> String {
    let mut doc = SettingsDocument::default();
    for (key, value) in map {
        doc.upsert(key, value);
    }
    doc.to_text()
}

fn parse_assignment(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    Some((key.trim().to_string(), parse_value(value)))
}

fn parse_value(value: &str) -> String {
    let lead = value.trim_start();
    if let Some(inner) = quoted_inner(lead) {
        return inner.to_string();
    }
    let uncommented = value.split('#').next().unwrap_or_default();
    uncommented
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string()
}

/// `'...'` or `"..."` followed only by whitespace or an inline comment.
fn quoted_inner(value: &str) -> Option<&str> {
    let quote = value.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = &value[1..];
    for (idx, _) in body.rmatch_indices(quote) {
        let rest = body[idx + 1..].trim_start();
        if rest.is_empty() || rest.starts_with('#') {
            return Some(&body[..idx]);
        }
    }
    None
}

/// Quote a value only when the bare form would not parse back unchanged.
fn quote_value(value: &str) -> String {
    let needs_quotes = value.contains('#')
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace)
        || value.starts_with(['"', '\''])
        || value.ends_with(['"', '\'']);
    if !needs_quotes {
        return value.to_string();
    }
    if value.contains('"') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn parse_skips_comments_and_strips_inline_comments_and_quotes() {
        let text = "\
# header comment

PROJECT_NAME=genai
LLM_PROVIDER_SOURCE=ollama-container-cpu # pick one
QUOTED=\"hello world\"
SINGLE='x'
  SPACED = value  
not an assignment
";
        let map = parse_settings(text);
        assert_eq!(map.get("PROJECT_NAME").map(String::as_str), Some("genai"));
        assert_eq!(
            map.get("LLM_PROVIDER_SOURCE").map(String::as_str),
            Some("ollama-container-cpu")
        );
        assert_eq!(map.get("QUOTED").map(String::as_str), Some("hello world"));
        assert_eq!(map.get("SINGLE").map(String::as_str), Some("x"));
        assert_eq!(map.get("SPACED").map(String::as_str), Some("value"));
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn later_duplicate_overwrites_earlier() {
        let map = parse_settings("A=1\nA=2\n");
        assert_eq!(map.get("A").map(String::as_str), Some("2"));
    }

    #[test]
    fn upsert_replaces_in_place_and_keeps_comments() {
        let mut doc = SettingsDocument::from_text("# ports\nREDIS_PORT=1\n\nOTHER=x\n");
        doc.upsert("REDIS_PORT", "63001");
        assert_eq!(doc.to_text(), "# ports\nREDIS_PORT=63001\n\nOTHER=x\n");
    }

    #[test]
    fn upsert_appends_missing_key() {
        let mut doc = SettingsDocument::from_text("A=1");
        doc.upsert("B", "2");
        assert_eq!(doc.to_text(), "A=1\nB=2\n");
    }

    #[test]
    fn upsert_twice_is_idempotent() {
        let mut doc = SettingsDocument::from_text("# c\nA=1\n");
        doc.upsert("N8N_SCALE", "0");
        let once = doc.to_text();
        doc.upsert("N8N_SCALE", "0");
        assert_eq!(doc.to_text(), once);
    }

    #[test]
    fn value_with_hash_is_quoted_on_write() {
        let mut doc = SettingsDocument::default();
        doc.upsert("PASSWORD", "a#b");
        assert_eq!(doc.to_text(), "PASSWORD=\"a#b\"\n");
        assert_eq!(doc.to_map().get("PASSWORD").map(String::as_str), Some("a#b"));
    }

    proptest! {
        #[test]
        fn parse_of_serialize_round_trips(
            map in prop::collection::btree_map("[A-Z_][A-Z0-9_]{0,12}", "[ -~]{0,24}", 0..8)
        ) {
            let text = serialize_settings(&map);
            prop_assert_eq!(parse_settings(&text), map);
        }
    }
}
