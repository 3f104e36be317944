//! Settings repository: the flat `KEY=VALUE` file that is the single source of
//! truth for selectors, ports and computed variables.

pub mod line;
pub mod store;

pub use line::{SettingsDocument, parse_settings, serialize_settings};
pub use store::{EnvFile, SettingsStore};

use std::collections::BTreeMap;

/// Parsed view of the settings file. Later duplicate keys win.
pub type SettingsMap = BTreeMap<String, String>;
