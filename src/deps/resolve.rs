//! Enablement, violation check and automatic repair.

use crate::deps::DependencyGraph;
use crate::schema::{ServiceSchema, source_variable};
use crate::settings::SettingsMap;
use tracing::{info, warn};

/// Services whose scale variable does not follow `<KEY>_SCALE`.
const SCALE_VARIABLES: &[(&str, &str)] = &[
    ("llm_provider", "OLLAMA_SCALE"),
    ("multi2vec-clip", "CLIP_SCALE"),
    ("n8n-worker", "N8N_SCALE"),
    ("neo4j-graph-db", "NEO4J_SCALE"),
    ("stt_provider", "PARAKEET_GPU_SCALE"),
];

/// Scale variables that must move 1:1 with a primary.
const MIRRORED_SCALES: &[(&str, &[&str])] = &[
    ("N8N_SCALE", &["N8N_WORKER_SCALE", "N8N_INIT_SCALE"]),
    ("WEAVIATE_SCALE", &["WEAVIATE_INIT_SCALE"]),
];

pub fn scale_variable(service: &str) -> String {
    SCALE_VARIABLES
        .iter()
        .find(|(key, _)| *key == service)
        .map(|(_, var)| var.to_string())
        .unwrap_or_else(|| format!("{}_SCALE", service.to_uppercase().replace('-', "_")))
}

pub fn mirrors_of(scale_var: &str) -> &'static [&'static str] {
    MIRRORED_SCALES
        .iter()
        .find(|(primary, _)| *primary == scale_var)
        .map(|(_, mirrors)| *mirrors)
        .unwrap_or(&[])
}

/// `scale(service) > 0`. A `disabled` selector always wins; otherwise an
/// explicit scale value decides, and a service with neither is enabled.
pub fn enabled(settings: &SettingsMap, service: &str) -> bool {
    if settings.get(&source_variable(service)).map(String::as_str) == Some("disabled") {
        return false;
    }
    match settings
        .get(&scale_variable(service))
        .and_then(|v| v.trim().parse::<u32>().ok())
    {
        Some(scale) => scale > 0,
        None => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub service: String,
    pub required: String,
    pub message: String,
}

/// Outcome of resolving to a fixpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub violations: Vec<Violation>,
    /// Services forced to scale 0, in the order they were disabled.
    pub disabled: Vec<String>,
    /// Scale assignments made while disabling, ready to persist.
    pub patch: SettingsMap,
    /// Optional-dependency notes.
    pub info: Vec<String>,
}

pub struct DependencyResolver<'a> {
    schema: &'a ServiceSchema,
    graph: DependencyGraph,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(schema: &'a ServiceSchema) -> Self {
        let graph = DependencyGraph::build(schema);
        if let Some(cycle) = graph.find_cycle() {
            warn!("service dependency cycle: {}", cycle.join(" -> "));
        }
        for service in graph.services() {
            if schema.classify(&source_variable(service)).is_none() {
                warn!("dependency declaration names unknown service {}", service);
            }
        }
        Self { schema, graph }
    }

    /// Declared requires/optional for one service.
    pub fn info(&self, service: &str) -> Option<&crate::schema::DependencySpec> {
        self.schema.service_dependencies.get(service)
    }

    /// Every `requires` edge from an enabled service to a disabled one.
    pub fn check(&self, settings: &SettingsMap) -> Vec<Violation> {
        let mut out = Vec::new();
        for (service, requires) in &self.graph.requires {
            if !enabled(settings, service) {
                continue;
            }
            for required in requires {
                if enabled(settings, required) {
                    continue;
                }
                let message = self
                    .info(service)
                    .and_then(|spec| spec.error_message.clone())
                    .unwrap_or_else(|| {
                        format!("{} requires {} but it's disabled", service, required)
                    });
                out.push(Violation {
                    service: service.clone(),
                    required: required.clone(),
                    message,
                });
            }
        }
        out
    }

    /// Notes naming the enabled optional peers of each enabled service.
    pub fn optional_info(&self, settings: &SettingsMap) -> Vec<String> {
        let mut out = Vec::new();
        for (service, optional) in &self.graph.optional {
            if optional.is_empty() || !enabled(settings, service) {
                continue;
            }
            let available: Vec<&str> = optional
                .iter()
                .filter(|peer| enabled(settings, peer))
                .map(String::as_str)
                .collect();
            if available.is_empty() {
                continue;
            }
            let peers = available.join(", ");
            let note = match self.info(service).and_then(|s| s.info_message.as_deref()) {
                Some(msg) => format!("{} ({})", msg, peers),
                None => format!("{} will connect to: {}", service, peers),
            };
            out.push(note);
        }
        out
    }

    /// Force each violating service (and its mirrors) to scale 0. Returns the
    /// services disabled by this pass.
    pub fn auto_resolve(
        &self,
        settings: &mut SettingsMap,
        violations: &[Violation],
        patch: &mut SettingsMap,
    ) -> Vec<String> {
        let mut disabled = Vec::new();
        for violation in violations {
            if disabled.contains(&violation.service) {
                continue;
            }
            let scale_var = scale_variable(&violation.service);
            for var in std::iter::once(scale_var.as_str()).chain(mirrors_of(&scale_var).iter().copied()) {
                settings.insert(var.to_string(), "0".to_string());
                patch.insert(var.to_string(), "0".to_string());
            }
            info!(
                "disabled {} ({}): {}",
                violation.service, scale_var, violation.message
            );
            disabled.push(violation.service.clone());
        }
        disabled
    }

    /// Copy of `settings` in which every schema service is judged by its
    /// selector. Scale variables left over from an earlier run are dropped,
    /// and a configurable service without a selector gets its default one.
    pub fn working_view(&self, settings: &SettingsMap) -> SettingsMap {
        let mut view = settings.clone();
        let services = self
            .schema
            .source_configurable
            .keys()
            .chain(self.schema.fixed_services.keys())
            .chain(self.schema.adaptive_services.keys());
        for service in services {
            let scale_var = scale_variable(service);
            for var in mirrors_of(&scale_var) {
                view.remove(*var);
            }
            view.remove(&scale_var);
        }
        for service in self.schema.source_configurable.keys() {
            let selector = source_variable(service);
            if view.get(&selector).is_some_and(|v| !v.is_empty()) {
                continue;
            }
            if let Some(default) = self.schema.default_source(service) {
                view.insert(selector, default.to_string());
            }
        }
        view
    }

    /// Check and repair until no violation remains. Each round disables at
    /// least one enabled service, so the loop ends after at most one round per
    /// service.
    pub fn resolve(&self, settings: &mut SettingsMap) -> Resolution {
        let mut resolution = Resolution::default();
        let rounds = self.graph.services().len() + 1;
        for _ in 0..rounds {
            let violations = self.check(settings);
            if violations.is_empty() {
                break;
            }
            for v in &violations {
                warn!("{}", v.message);
            }
            let disabled = self.auto_resolve(settings, &violations, &mut resolution.patch);
            resolution.violations.extend(violations);
            resolution.disabled.extend(disabled);
        }
        resolution.info = self.optional_info(settings);
        for note in &resolution.info {
            info!("{}", note);
        }
        resolution
    }
}
