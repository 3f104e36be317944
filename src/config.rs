//! File locations used by a run.

use crate::settings::EnvFile;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Process environment variable that moves the settings file elsewhere.
pub const ENV_FILE_VAR: &str = "GENAI_ENV_FILE";

pub const SCHEMA_RELATIVE: &str = "bootstrapper/service-configs.yml";
pub const TEMPLATE_RELATIVE: &str = ".env.example";
pub const GATEWAY_RELATIVE: &str = "volumes/api/kong-dynamic.yml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub root: PathBuf,
    pub schema: PathBuf,
    pub env_file: PathBuf,
    /// Settings path came from [`ENV_FILE_VAR`].
    pub custom_env_file: bool,
    pub template: PathBuf,
    pub gateway: PathBuf,
}

impl Paths {
    /// Precedence for the settings file: explicit argument, then
    /// `env_override` (the value of [`ENV_FILE_VAR`]), then `<root>/.env`.
    pub fn resolve(
        root: &Path,
        env_file: Option<&Path>,
        schema: Option<&Path>,
        env_override: Option<OsString>,
    ) -> Self {
        let (env_file, custom_env_file) = match (env_file, env_override) {
            (Some(explicit), _) => (explicit.to_path_buf(), false),
            (None, Some(value)) if !value.is_empty() => (expand_home(Path::new(&value)), true),
            _ => (root.join(".env"), false),
        };
        Self {
            root: root.to_path_buf(),
            schema: schema
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.join(SCHEMA_RELATIVE)),
            env_file,
            custom_env_file,
            template: root.join(TEMPLATE_RELATIVE),
            gateway: root.join(GATEWAY_RELATIVE),
        }
    }

    /// Same as [`Paths::resolve`], reading the override from the process.
    pub fn from_process(root: &Path, env_file: Option<&Path>, schema: Option<&Path>) -> Self {
        Self::resolve(root, env_file, schema, std::env::var_os(ENV_FILE_VAR))
    }

    pub fn store(&self) -> EnvFile {
        EnvFile::new(&self.env_file).with_custom_location(self.custom_env_file)
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
