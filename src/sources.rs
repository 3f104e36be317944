//! Source resolver: selector assignments extracted from the settings.

use crate::error::Error;
use crate::settings::SettingsMap;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::info;

/// The always-on adaptive backend. Not editable through the settings file.
pub const BACKEND_SOURCE: (&str, &str) = ("BACKEND_SOURCE", "container");

/// `<NAME>_SOURCE` -> selector value.
pub type SourceMap = BTreeMap<String, String>;

fn source_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9_]+_SOURCE$").expect("static source pattern"))
}

pub fn is_source_key(key: &str) -> bool {
    source_key_re().is_match(key)
}

/// Every `<NAME>_SOURCE` assignment plus the fixed backend default.
pub fn resolve_all(settings: &SettingsMap) -> SourceMap {
    let mut out = SourceMap::new();
    out.insert(BACKEND_SOURCE.0.to_string(), BACKEND_SOURCE.1.to_string());
    for (key, value) in settings {
        if is_source_key(key) {
            out.insert(key.clone(), value.clone());
        }
    }
    // The backend selector is fixed even if someone edits it.
    out.insert(BACKEND_SOURCE.0.to_string(), BACKEND_SOURCE.1.to_string());
    out
}

/// Parse `VAR=value` override arguments.
pub fn parse_override(arg: &str) -> Result<(String, String), Error> {
    let (key, value) = arg.split_once('=').ok_or_else(|| {
        Error::Validation(vec![format!(
            "override '{}' must look like NAME_SOURCE=value",
            arg
        )])
    })?;
    let key = key.trim().to_string();
    if !is_source_key(&key) {
        return Err(Error::Validation(vec![format!(
            "override '{}' does not name a _SOURCE variable",
            key
        )]));
    }
    Ok((key, value.trim().to_string()))
}

/// What happens to run-scoped selector overrides once the run succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideMode {
    /// Applied to the in-memory snapshot for this run only.
    Ephemeral,
    /// Written to the settings file together with the computed environment.
    Persistent,
}

/// Apply overrides to the in-memory `settings` snapshot. Nothing is written
/// here; a persistent override reaches the file only after validation passes.
pub fn apply_overrides(settings: &mut SettingsMap, overrides: &SourceMap) {
    for (key, value) in overrides {
        info!("source override {} -> {}", key, value);
        settings.insert(key.clone(), value.clone());
    }
}
