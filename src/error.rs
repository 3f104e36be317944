//! Error kinds surfaced by the resolution pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The service schema could not be read or parsed. Always fatal.
    #[error("failed to load service schema {path}: {reason}")]
    SchemaLoad { path: PathBuf, reason: String },

    /// Reading or writing the settings file failed.
    #[error("settings file {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file has to exist for this operation.
    #[error("settings file not found: {0}")]
    SettingsMissing(PathBuf),

    /// A backup was requested and could not be made, so nothing was written.
    #[error("backup of {path} failed: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every selector/scale violation found in one pass.
    #[error("{} configuration violation(s):\n  {}", .0.len(), .0.join("\n  "))]
    Validation(Vec<String>),

    #[error("invalid base port {base}: must be between 1024 and {max}")]
    InvalidBasePort { base: u32, max: u32 },

    #[error("ports already in use for base {base}: {}{}", format_conflicts(.conflicts), format_suggestion(.suggestion))]
    PortConflict {
        base: u16,
        conflicts: BTreeMap<String, u16>,
        suggestion: Option<u16>,
    },

    /// One gateway entry could not be built; the rest of the table is unaffected.
    #[error("gateway entry {entry}: {reason}")]
    Gateway { entry: String, reason: String },

    #[error("failed to write gateway config {path}: {reason}")]
    GatewayWrite { path: PathBuf, reason: String },
}

fn format_conflicts(conflicts: &BTreeMap<String, u16>) -> String {
    conflicts
        .iter()
        .map(|(var, port)| format!("{}={}", var, port))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_suggestion(suggestion: &Option<u16>) -> String {
    match suggestion {
        Some(base) => format!(" (try --base-port {})", base),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn port_conflict_message_names_variables_and_suggestion() {
        let mut conflicts = BTreeMap::new();
        conflicts.insert("SUPABASE_STORAGE_PORT".to_string(), 63005);
        let err = Error::PortConflict {
            base: 63000,
            conflicts,
            suggestion: Some(50000),
        };
        assert_eq!(
            err.to_string(),
            "ports already in use for base 63000: SUPABASE_STORAGE_PORT=63005 (try --base-port 50000)"
        );
    }

    #[test]
    fn validation_message_lists_every_violation() {
        let err = Error::Validation(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "2 configuration violation(s):\n  a\n  b");
    }
}
