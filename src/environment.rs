//! Environment synthesizer: derived variables from the selected schema
//! variants, dependency repairs and the platform loopback host.

use crate::deps::{mirrors_of, scale_variable};
use crate::error::Error;
use crate::schema::{ServiceSchema, SourceConfig, source_variable};
use crate::settings::{SettingsMap, SettingsStore};
use crate::sources::SourceMap;
use std::net::ToSocketAddrs;
use tracing::{debug, info, warn};

/// Placeholder host in schema URLs meaning "the machine running docker".
pub const LOOPBACK_ALIAS: &str = "host.docker.internal";
/// Default docker bridge gateway, used on Linux when the alias does not resolve.
pub const DOCKER_BRIDGE_GATEWAY: &str = "172.17.0.1";

const GPU_SPEECH_SOURCE: &str = "parakeet-container-gpu";
const GPU_SPEECH_PROFILE: &str = "parakeet-gpu";

pub type ComputedEnvironment = SettingsMap;

/// Host to substitute for [`LOOPBACK_ALIAS`] on `os`.
pub fn resolve_loopback_host(os: &str, alias_resolves: impl FnOnce(&str) -> bool) -> String {
    if os == "linux" && !alias_resolves(LOOPBACK_ALIAS) {
        return DOCKER_BRIDGE_GATEWAY.to_string();
    }
    LOOPBACK_ALIAS.to_string()
}

pub fn system_loopback_host() -> String {
    resolve_loopback_host(std::env::consts::OS, |host| {
        (host, 0)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false)
    })
}

/// Services whose variables do not follow the generic `<KEY>_...` naming.
struct Profile {
    service: &'static str,
    /// Selector when neither the settings nor the schema name one.
    fallback: &'static str,
    endpoint: Option<(&'static str, &'static str)>,
    deploy: Option<&'static str>,
    /// (schema environment key, output variable, default)
    passthrough: &'static [(&'static str, &'static str, &'static str)],
}

const PROFILES: &[Profile] = &[
    Profile {
        service: "llm_provider",
        fallback: "ollama-container-cpu",
        endpoint: Some(("OLLAMA_ENDPOINT", "http://ollama:11434")),
        deploy: Some("OLLAMA_DEPLOY_RESOURCES"),
        passthrough: &[("NVIDIA_VISIBLE_DEVICES", "OLLAMA_NVIDIA_VISIBLE_DEVICES", "null")],
    },
    Profile {
        service: "comfyui",
        fallback: "container-cpu",
        endpoint: Some(("COMFYUI_ENDPOINT", "http://comfyui:18188")),
        deploy: Some("COMFYUI_DEPLOY_RESOURCES"),
        passthrough: &[("IS_LOCAL_COMFYUI", "IS_LOCAL_COMFYUI", "false")],
    },
    Profile {
        service: "weaviate",
        fallback: "container",
        endpoint: Some(("WEAVIATE_URL", "http://weaviate:8080")),
        deploy: None,
        passthrough: &[],
    },
    Profile {
        service: "multi2vec-clip",
        fallback: "container-cpu",
        endpoint: None,
        deploy: Some("CLIP_DEPLOY_RESOURCES"),
        passthrough: &[("ENABLE_CUDA", "CLIP_ENABLE_CUDA", "0")],
    },
    Profile {
        service: "stt_provider",
        fallback: "disabled",
        endpoint: Some(("PARAKEET_ENDPOINT", "http://host.docker.internal:10300")),
        deploy: None,
        passthrough: &[],
    },
    Profile {
        service: "neo4j-graph-db",
        fallback: "container",
        endpoint: Some(("NEO4J_URI", "bolt://neo4j-graph-db:7687")),
        deploy: None,
        passthrough: &[],
    },
];

pub struct EnvironmentSynthesizer<'a> {
    schema: &'a ServiceSchema,
    loopback_host: String,
}

impl<'a> EnvironmentSynthesizer<'a> {
    pub fn new(schema: &'a ServiceSchema, loopback_host: impl Into<String>) -> Self {
        Self {
            schema,
            loopback_host: loopback_host.into(),
        }
    }

    /// Selected variant for `service`: the settings value, else the schema
    /// default, else `fallback`.
    pub fn selected_source(&self, sources: &SourceMap, service: &str, fallback: &str) -> String {
        sources
            .get(&source_variable(service))
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| self.schema.default_source(service).map(str::to_string))
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Compute every derived variable. `forced` holds the dependency
    /// resolver's scale repairs; they win over the schema scales, over the
    /// derived and adaptive scales, and feed the mirror copy.
    pub fn synthesize(
        &self,
        settings: &SettingsMap,
        sources: &SourceMap,
        forced: &SettingsMap,
    ) -> ComputedEnvironment {
        let mut env = ComputedEnvironment::new();
        debug!("loopback host for local services: {}", self.loopback_host);

        for service in self.schema.source_configurable.keys() {
            match PROFILES.iter().find(|p| p.service == service.as_str()) {
                Some(profile) => self.profiled(profile, sources, &mut env),
                None => self.generic(service, sources, &mut env),
            }
        }

        for (var, value) in forced {
            env.insert(var.clone(), value.clone());
        }

        self.derived(settings, sources, forced, &mut env);
        self.adaptive(sources, &mut env);
        copy_mirrors(&mut env);
        env
    }

    fn profiled(&self, profile: &Profile, sources: &SourceMap, env: &mut ComputedEnvironment) {
        let source = self.selected_source(sources, profile.service, profile.fallback);
        let config = self.schema.config(profile.service, &source);
        let scale = config.map(|c| c.scale).unwrap_or(1);
        env.insert(scale_variable(profile.service), scale.to_string());

        let environment = config.map(|c| &c.environment);
        let lookup = |key: &str| environment.and_then(|e| e.get(key)).cloned();

        if let Some((var, default)) = profile.endpoint {
            let endpoint = lookup(var).unwrap_or_else(|| default.to_string());
            env.insert(var.to_string(), self.substitute(&endpoint));
        }
        for &(key, var, default) in profile.passthrough {
            let value = lookup(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string());
            env.insert(var.to_string(), value);
        }
        if let Some(var) = profile.deploy {
            env.insert(var.to_string(), render_deploy(config));
        }
    }

    /// Services without a profile: `<KEY>_SCALE`, their environment entries
    /// and, when declared, `<KEY>_DEPLOY_RESOURCES`.
    fn generic(&self, service: &str, sources: &SourceMap, env: &mut ComputedEnvironment) {
        let source = self.selected_source(sources, service, "container");
        let Some(config) = self.schema.config(service, &source) else {
            warn!("{} has no schema entry for source '{}'", service, source);
            return;
        };
        env.insert(scale_variable(service), config.scale.to_string());
        for (var, value) in &config.environment {
            env.insert(var.clone(), self.substitute(value));
        }
        if config.deploy.is_some() {
            let prefix = service.to_uppercase().replace('-', "_");
            env.insert(format!("{}_DEPLOY_RESOURCES", prefix), render_deploy(Some(config)));
        }
    }

    fn derived(
        &self,
        settings: &SettingsMap,
        sources: &SourceMap,
        forced: &SettingsMap,
        env: &mut ComputedEnvironment,
    ) {
        let declared = |service: &str| self.schema.source_configurable.contains_key(service);
        let forced_off = |service: &str| {
            forced.get(&scale_variable(service)).map(String::as_str) == Some("0")
        };

        if declared("llm_provider") {
            let source = self.selected_source(sources, "llm_provider", "ollama-container-cpu");
            let running = env.get("OLLAMA_SCALE").map(String::as_str) != Some("0");
            let pull = source.starts_with("ollama-container") && running;
            env.insert("OLLAMA_PULL_SCALE".into(), flag(pull));
        }

        if declared("weaviate") {
            let endpoint = env
                .get("OLLAMA_ENDPOINT")
                .cloned()
                .unwrap_or_else(|| "http://ollama:11434".to_string());
            env.insert("WEAVIATE_OLLAMA_ENDPOINT".into(), endpoint);
        }

        if declared("comfyui") {
            let source = self.selected_source(sources, "comfyui", "container-cpu");
            let init = source != "disabled" && !forced_off("comfyui");
            env.insert("COMFYUI_INIT_SCALE".into(), flag(init));
        }

        if declared("stt_provider") {
            let source = self.selected_source(sources, "stt_provider", "disabled");
            let gpu = source == GPU_SPEECH_SOURCE && !forced_off("stt_provider");
            env.insert(scale_variable("stt_provider"), flag(gpu));
            if gpu {
                let current = settings.get("COMPOSE_PROFILES").map(String::as_str).unwrap_or("");
                env.insert("COMPOSE_PROFILES".into(), add_profile(current, GPU_SPEECH_PROFILE));
            } else if source == "disabled" {
                env.insert("PARAKEET_ENDPOINT".into(), String::new());
            }
        }
    }

    /// Presence-based services run unless their selector says `disabled`.
    /// The backend always runs.
    fn adaptive(&self, sources: &SourceMap, env: &mut ComputedEnvironment) {
        for service in self.schema.adaptive_services.keys() {
            let var = scale_variable(service);
            if env.get(&var).map(String::as_str) == Some("0") {
                continue;
            }
            let disabled = service != "backend"
                && sources.get(&source_variable(service)).map(String::as_str) == Some("disabled");
            env.insert(var, flag(!disabled));
        }
    }

    fn substitute(&self, value: &str) -> String {
        value.replace(LOOPBACK_ALIAS, &self.loopback_host)
    }
}

/// Write `env` in one pass, preceded by one backup when asked.
pub fn persist(store: &dyn SettingsStore, env: &ComputedEnvironment, backup: bool) -> Result<(), Error> {
    store.upsert_many(env, backup)?;
    info!("updated {} computed variable(s)", env.len());
    Ok(())
}

fn copy_mirrors(env: &mut ComputedEnvironment) {
    let primaries: Vec<(String, String)> = env
        .iter()
        .filter(|(var, _)| !mirrors_of(var).is_empty())
        .map(|(var, value)| (var.clone(), value.clone()))
        .collect();
    for (primary, value) in primaries {
        for mirror in mirrors_of(&primary) {
            env.insert(mirror.to_string(), value.clone());
        }
    }
}

fn render_deploy(config: Option<&SourceConfig>) -> String {
    let Some(deploy) = config.and_then(|c| c.deploy.as_ref()) else {
        return "~".to_string();
    };
    // JSON is valid YAML flow style, which compose accepts inline.
    match serde_json::to_string(deploy) {
        Ok(rendered) => rendered,
        Err(err) => {
            warn!("cannot render deploy hints: {}", err);
            "~".to_string()
        }
    }
}

fn flag(on: bool) -> String {
    let value = if on { "1" } else { "0" };
    value.to_string()
}

fn add_profile(current: &str, profile: &str) -> String {
    let mut profiles: Vec<&str> = current
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if !profiles.contains(&profile) {
        profiles.push(profile);
    }
    profiles.join(",")
}
