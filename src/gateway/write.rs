//! Checking and persisting the routing document.

use crate::error::Error;
use crate::gateway::model::GatewayDocument;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Every structural problem in `document`; empty when it is usable.
pub fn validate(document: &GatewayDocument) -> Vec<String> {
    let mut errors = Vec::new();
    if document.format_version.is_empty() {
        errors.push("missing _format_version".to_string());
    }
    if document.services.is_empty() {
        errors.push("no services".to_string());
    }
    let mut seen = BTreeSet::new();
    for (i, service) in document.services.iter().enumerate() {
        let label = if service.name.is_empty() {
            format!("service #{}", i)
        } else {
            service.name.clone()
        };
        if service.name.is_empty() {
            errors.push(format!("{} has no name", label));
        } else if !seen.insert(service.name.as_str()) {
            errors.push(format!("{} appears more than once", label));
        }
        if service.url.trim().is_empty() {
            errors.push(format!("{} has no upstream url", label));
        }
        if service.routes.is_empty() {
            errors.push(format!("{} has no route", label));
        }
    }
    errors
}

/// Serialize to YAML next to `path` and move it into place, creating parent
/// directories first. The caller's in-memory document is left untouched on
/// failure.
pub fn write(document: &GatewayDocument, path: &Path) -> Result<(), Error> {
    let fail = |reason: String| Error::GatewayWrite {
        path: path.to_path_buf(),
        reason,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;

    let yaml = serde_yaml::to_string(document).map_err(|e| fail(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| fail(e.to_string()))?;
    tmp.write_all(yaml.as_bytes())
        .map_err(|e| fail(e.to_string()))?;
    tmp.persist(path).map_err(|e| fail(e.error.to_string()))?;

    info!(
        "wrote {} gateway service(s) to {}",
        document.services.len(),
        path.display()
    );
    Ok(())
}
