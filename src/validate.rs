//! Validator: selectors against the schema enumeration, scales against their
//! numeric domain. All violations are collected before anything is reported.

use crate::error::Error;
use crate::schema::model::ADAPTIVE_SOURCE;
use crate::schema::{ServiceClass, ServiceSchema};
use crate::settings::SettingsMap;
use crate::sources::{BACKEND_SOURCE, SourceMap};
use tracing::warn;

pub struct Validator<'a> {
    schema: &'a ServiceSchema,
}

/// Outcome of the scale check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleReport {
    pub violations: Vec<String>,
    /// Scale values above 1; legal but unusual for this stack.
    pub advisories: Vec<String>,
}

impl<'a> Validator<'a> {
    pub fn new(schema: &'a ServiceSchema) -> Self {
        Self { schema }
    }

    /// The violation for one selector, if any.
    pub fn check_source(&self, key: &str, value: &str) -> Option<String> {
        match self.schema.classify(key) {
            Some(ServiceClass::Adaptive(_)) => (value != ADAPTIVE_SOURCE).then(|| {
                format!(
                    "{}='{}' is invalid. Adaptive services only support '{}'",
                    key, value, ADAPTIVE_SOURCE
                )
            }),
            Some(ServiceClass::Configurable(service)) | Some(ServiceClass::Fixed(service)) => {
                let valid = self.schema.valid_sources(service);
                if valid.is_empty() {
                    return Some(format!("No valid sources found for service: {}", service));
                }
                if valid.contains(value) {
                    return None;
                }
                let options = self.source_options(key).join(", ");
                let suggestion = self.suggest(key).unwrap_or_default();
                Some(format!(
                    "{}='{}' is invalid. Valid options: {} (e.g. {}={})",
                    key, value, options, key, suggestion
                ))
            }
            None => Some(format!("Unknown SOURCE variable: {}", key)),
        }
    }

    pub fn validate_source(&self, key: &str, value: &str) -> bool {
        self.check_source(key, value).is_none()
    }

    /// Check every non-empty selector; empty values fall back to defaults.
    /// A map holding nothing but the pinned backend means the settings name
    /// no selector at all.
    pub fn validate_sources(&self, sources: &SourceMap) -> Vec<String> {
        if sources.keys().all(|key| key == BACKEND_SOURCE.0) {
            return vec!["No SOURCE configurations found".to_string()];
        }
        sources
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .filter_map(|(key, value)| self.check_source(key, value))
            .collect()
    }

    /// Sorted legal values for a selector variable.
    pub fn source_options(&self, key: &str) -> Vec<String> {
        match self.schema.classify(key) {
            Some(ServiceClass::Adaptive(_)) => vec![ADAPTIVE_SOURCE.to_string()],
            Some(ServiceClass::Configurable(service)) | Some(ServiceClass::Fixed(service)) => self
                .schema
                .valid_sources(service)
                .into_iter()
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// First legal value, offered next to a violation. Typos are never fixed
    /// automatically.
    pub fn suggest(&self, key: &str) -> Option<String> {
        self.source_options(key).into_iter().next()
    }

    /// Run both checks and fail once with every violation.
    pub fn validate(&self, settings: &SettingsMap, sources: &SourceMap) -> Result<(), Error> {
        let mut violations = self.validate_sources(sources);
        let scales = validate_scales(settings);
        for advisory in &scales.advisories {
            warn!("{}", advisory);
        }
        violations.extend(scales.violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(violations))
        }
    }
}

/// Every `*_SCALE` value must be an integer >= 0. Empty values are skipped.
pub fn validate_scales(settings: &SettingsMap) -> ScaleReport {
    let mut report = ScaleReport::default();
    for (key, value) in settings.iter().filter(|(k, _)| k.ends_with("_SCALE")) {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match value.parse::<i64>() {
            Ok(n) if n < 0 => report.violations.push(format!(
                "{}='{}' is invalid. Scale must be 0 or positive integer",
                key, value
            )),
            Ok(n) if n > 1 => report.advisories.push(format!(
                "{}='{}' - high scale values may cause resource issues (services assume a single replica)",
                key, value
            )),
            Ok(_) => {}
            Err(_) => report.violations.push(format!(
                "{}='{}' is invalid. Scale must be a number",
                key, value
            )),
        }
    }
    report
}
