//! Schema document (YAML) and the immutable lookup structure built from it.
//!
//! Document shape:
//! ```yaml
//! source_configurable:
//!   llm_provider:
//!     ollama-container-cpu:
//!       scale: 1
//!       environment: { OLLAMA_ENDPOINT: "http://ollama:11434" }
//!       deploy: { resources: { limits: { memory: 8G } } }
//!     disabled: { scale: 0 }
//! fixed_services:
//!   kong-api-gateway:
//!     container: { scale: 1 }
//! adaptive_services:
//!   backend: {}
//! service_dependencies:
//!   n8n:
//!     requires: [weaviate]
//!     optional: [searxng]
//!     error_message: "..."
//!     info_message: "..."
//! ```

use crate::error::Error;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Selector value the adaptive class accepts.
pub const ADAPTIVE_SOURCE: &str = "container";

/// Conventional selector variable for a service key: `neo4j-graph-db` ->
/// `NEO4J_GRAPH_DB_SOURCE`.
pub fn source_variable(service_key: &str) -> String {
    format!("{}_SOURCE", service_key.to_uppercase().replace('-', "_"))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_scale")]
    pub scale: u32,

    #[serde(default, deserialize_with = "deserialize_env")]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub deploy: Option<serde_yaml::Value>,
}

fn default_scale() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencySpec {
    #[serde(default)]
    pub requires: Vec<String>,

    #[serde(default)]
    pub optional: Vec<String>,

    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub info_message: Option<String>,
}

/// How a selector variable relates to the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceClass<'a> {
    Configurable(&'a str),
    Fixed(&'a str),
    Adaptive(&'a str),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSchema {
    #[serde(default)]
    pub source_configurable: BTreeMap<String, BTreeMap<String, SourceConfig>>,

    #[serde(default)]
    pub fixed_services: BTreeMap<String, BTreeMap<String, SourceConfig>>,

    #[serde(default)]
    pub adaptive_services: BTreeMap<String, serde_yaml::Value>,

    #[serde(default)]
    pub service_dependencies: BTreeMap<String, DependencySpec>,

    /// Selector used when a service's variable is empty or absent.
    #[serde(default)]
    pub default_sources: BTreeMap<String, String>,
}

impl ServiceSchema {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|e| Error::SchemaLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&text).map_err(|e| match e {
            Error::SchemaLoad { reason, .. } => Error::SchemaLoad {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        let schema: ServiceSchema = serde_yaml::from_str(text).map_err(|e| Error::SchemaLoad {
            path: Default::default(),
            reason: e.to_string(),
        })?;
        if schema.source_configurable.is_empty() && schema.fixed_services.is_empty() {
            return Err(Error::SchemaLoad {
                path: Default::default(),
                reason: "schema declares no services".to_string(),
            });
        }
        Ok(schema)
    }

    /// Classify a `<NAME>_SOURCE` variable. Adaptive services are checked first.
    pub fn classify(&self, source_var: &str) -> Option<ServiceClass<'_>> {
        if let Some(key) = find_key(self.adaptive_services.keys(), source_var) {
            return Some(ServiceClass::Adaptive(key));
        }
        if let Some(key) = find_key(self.source_configurable.keys(), source_var) {
            return Some(ServiceClass::Configurable(key));
        }
        find_key(self.fixed_services.keys(), source_var).map(ServiceClass::Fixed)
    }

    /// Declared enumeration for a configurable or fixed service.
    pub fn valid_sources(&self, service_key: &str) -> BTreeSet<&str> {
        self.source_configurable
            .get(service_key)
            .or_else(|| self.fixed_services.get(service_key))
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn config(&self, service_key: &str, source: &str) -> Option<&SourceConfig> {
        self.source_configurable
            .get(service_key)
            .or_else(|| self.fixed_services.get(service_key))
            .and_then(|m| m.get(source))
    }

    /// Explicit default, else `container` when declared, else the first
    /// declared selector.
    pub fn default_source(&self, service_key: &str) -> Option<&str> {
        if let Some(explicit) = self.default_sources.get(service_key) {
            return Some(explicit.as_str());
        }
        let sources = self.valid_sources(service_key);
        if sources.contains(ADAPTIVE_SOURCE) {
            return Some(ADAPTIVE_SOURCE);
        }
        sources.into_iter().next()
    }

    pub fn is_adaptive(&self, service_key: &str) -> bool {
        self.adaptive_services.contains_key(service_key)
    }
}

fn find_key<'a>(
    mut keys: impl Iterator<Item = &'a String>,
    source_var: &str,
) -> Option<&'a str> {
    keys.find(|k| source_variable(k) == source_var)
        .map(String::as_str)
}

fn deserialize_env<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    // Environment overrides may be written as bare YAML numbers or booleans.
    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let rendered = match value {
            serde_yaml::Value::Null => String::new(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::String(s) => s,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "environment value for {} must be a scalar, got {:?}",
                    key, other
                )));
            }
        };
        out.insert(key, rendered);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Trimmed-down version of the stack's schema used across module tests.
    pub(crate) const SAMPLE_SCHEMA: &str = r#"
source_configurable:
  llm_provider:
    ollama-container-cpu:
      scale: 1
      environment:
        OLLAMA_ENDPOINT: "http://ollama:11434"
    ollama-container-gpu:
      scale: 1
      environment:
        OLLAMA_ENDPOINT: "http://ollama:11434"
        NVIDIA_VISIBLE_DEVICES: all
      deploy:
        resources:
          reservations:
            devices:
              - driver: nvidia
                count: all
    ollama-localhost:
      scale: 0
      environment:
        OLLAMA_ENDPOINT: "http://host.docker.internal:11434"
    disabled:
      scale: 0
  comfyui:
    container-cpu:
      scale: 1
      environment:
        COMFYUI_ENDPOINT: "http://comfyui:18188"
    localhost:
      scale: 0
      environment:
        COMFYUI_ENDPOINT: "http://host.docker.internal:8000"
        IS_LOCAL_COMFYUI: true
    external:
      scale: 0
    disabled:
      scale: 0
  weaviate:
    container:
      scale: 1
      environment:
        WEAVIATE_URL: "http://weaviate:8080"
    localhost:
      scale: 0
      environment:
        WEAVIATE_URL: "http://host.docker.internal:8080"
    disabled:
      scale: 0
  n8n:
    container:
      scale: 1
    disabled:
      scale: 0
  searxng:
    container:
      scale: 1
    disabled:
      scale: 0
fixed_services:
  kong-api-gateway:
    container:
      scale: 1
adaptive_services:
  backend: {}
  open-web-ui: {}
service_dependencies:
  n8n:
    requires: [weaviate]
    optional: [searxng]
    error_message: "n8n requires weaviate for vector storage"
    info_message: "n8n will use the available search providers"
default_sources:
  llm_provider: ollama-container-cpu
"#;

    pub(crate) fn sample() -> ServiceSchema {
        ServiceSchema::from_yaml(SAMPLE_SCHEMA).expect("sample schema parses")
    }

    #[test]
    fn source_variable_uppercases_and_replaces_dashes() {
        assert_eq!(source_variable("neo4j-graph-db"), "NEO4J_GRAPH_DB_SOURCE");
        assert_eq!(source_variable("llm_provider"), "LLM_PROVIDER_SOURCE");
    }

    #[test]
    fn classify_distinguishes_service_classes() {
        let schema = sample();
        assert_eq!(
            schema.classify("LLM_PROVIDER_SOURCE"),
            Some(ServiceClass::Configurable("llm_provider"))
        );
        assert_eq!(
            schema.classify("KONG_API_GATEWAY_SOURCE"),
            Some(ServiceClass::Fixed("kong-api-gateway"))
        );
        assert_eq!(
            schema.classify("BACKEND_SOURCE"),
            Some(ServiceClass::Adaptive("backend"))
        );
        assert_eq!(schema.classify("NOPE_SOURCE"), None);
    }

    #[test]
    fn environment_scalars_are_stringified() {
        let schema = sample();
        let cfg = schema.config("comfyui", "localhost").expect("config");
        assert_eq!(
            cfg.environment.get("IS_LOCAL_COMFYUI").map(String::as_str),
            Some("true")
        );
        assert_eq!(cfg.scale, 0);
    }

    #[test]
    fn default_source_prefers_explicit_then_container() {
        let schema = sample();
        assert_eq!(schema.default_source("llm_provider"), Some("ollama-container-cpu"));
        assert_eq!(schema.default_source("weaviate"), Some("container"));
        assert_eq!(schema.default_source("comfyui"), Some("container-cpu"));
    }

    #[test]
    fn empty_or_malformed_schema_is_a_load_error() {
        assert!(matches!(
            ServiceSchema::from_yaml("adaptive_services: {}"),
            Err(Error::SchemaLoad { .. })
        ));
        assert!(matches!(
            ServiceSchema::from_yaml("source_configurable: [1, 2"),
            Err(Error::SchemaLoad { .. })
        ));
    }

    #[test]
    fn demo_schema_is_well_formed() {
        let schema = ServiceSchema::from_yaml(include_str!("../../demos/bootstrapper/service-configs.yml"))
            .expect("demo schema parses");
        assert_eq!(
            schema.classify("LOCAL_DEEP_RESEARCHER_SOURCE"),
            Some(ServiceClass::Adaptive("local-deep-researcher"))
        );
        let clip = schema.config("multi2vec-clip", "container-gpu").expect("clip");
        assert_eq!(clip.environment.get("ENABLE_CUDA").map(String::as_str), Some("1"));
        assert!(clip.deploy.is_some());
    }

    #[test]
    fn load_reports_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.yml");
        match ServiceSchema::load(&path) {
            Err(Error::SchemaLoad { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected SchemaLoad, got {:?}", other),
        }
    }
}
