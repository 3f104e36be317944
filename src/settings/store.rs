//! File-backed settings repository.

use crate::error::Error;
use crate::settings::{SettingsDocument, SettingsMap, parse_settings};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Read-all / write-one / write-many access to the settings file.
///
/// Every stage receives the store explicitly; nothing reaches for the file
/// through global state.
pub trait SettingsStore {
    fn read_all(&self) -> Result<SettingsMap, Error>;

    /// Apply all assignments in one rewrite. With `backup`, a timestamped copy
    /// is taken first and a failed copy aborts the write.
    fn upsert_many(&self, values: &SettingsMap, backup: bool) -> Result<(), Error>;

    fn upsert(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut one = SettingsMap::new();
        one.insert(key.to_string(), value.to_string());
        self.upsert_many(&one, false)
    }
}

#[derive(Debug, Clone)]
pub struct EnvFile {
    path: PathBuf,
    custom_location: bool,
}

impl EnvFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            custom_location: false,
        }
    }

    /// Mark the path as coming from the settings-path override variable.
    pub fn with_custom_location(mut self, custom: bool) -> Self {
        self.custom_location = custom;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_custom_location(&self) -> bool {
        self.custom_location
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the settings file from `template` when it is missing, or always
    /// when `force` is set. Returns whether a copy was made.
    pub fn init_from_template(&self, template: &Path, force: bool) -> Result<bool, Error> {
        if self.exists() && !force {
            return Ok(false);
        }
        if !template.exists() {
            return Err(Error::SettingsMissing(template.to_path_buf()));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        fs::copy(template, &self.path).map_err(|source| self.io_error(source))?;
        info!(
            "created {} from {}",
            self.path.display(),
            template.display()
        );
        Ok(true)
    }

    /// Copy the file to `<name>.backup.<YYYYmmddHHMMSS>` next to it.
    pub fn backup(&self) -> Result<PathBuf, Error> {
        if !self.exists() {
            return Err(Error::BackupFailed {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            });
        }
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".env".to_string());
        let backup = self.path.with_file_name(format!("{}.backup.{}", name, stamp));
        fs::copy(&self.path, &backup).map_err(|source| Error::BackupFailed {
            path: self.path.clone(),
            source,
        })?;
        info!("created settings backup {}", backup.display());
        Ok(backup)
    }

    /// `PROJECT_NAME`, defaulting to `genai`.
    pub fn project_name(&self) -> Result<String, Error> {
        Ok(self
            .read_all()?
            .get("PROJECT_NAME")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| "genai".to_string()))
    }

    fn load_document(&self) -> Result<SettingsDocument, Error> {
        let text = fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
        Ok(SettingsDocument::from_text(&text))
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::Settings {
            path: self.path.clone(),
            source,
        }
    }
}

impl SettingsStore for EnvFile {
    fn read_all(&self) -> Result<SettingsMap, Error> {
        if !self.exists() {
            debug!("settings file {} not present", self.path.display());
            return Ok(SettingsMap::new());
        }
        let text = fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
        Ok(parse_settings(&text))
    }

    fn upsert_many(&self, values: &SettingsMap, backup: bool) -> Result<(), Error> {
        if !self.exists() {
            return Err(Error::SettingsMissing(self.path.clone()));
        }
        if backup {
            self.backup()?;
        }
        let mut doc = self.load_document()?;
        for (key, value) in values {
            if !doc.contains_key(key) {
                debug!("{} not in {}, appending", key, self.path.display());
            }
            doc.upsert(key, value);
        }
        fs::write(&self.path, doc.to_text()).map_err(|source| self.io_error(source))?;
        Ok(())
    }
}
