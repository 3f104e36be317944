//! Builds the routing table from the current selectors.

use crate::error::Error;
use crate::gateway::model::{Consumer, Credential, GatewayDocument, GatewayService, Plugin};
use crate::ports::{PortProbe, TcpProbe};
use crate::schema::source_variable;
use crate::settings::SettingsMap;
use crate::sources::SourceMap;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Timeout of the advisory probe against host-local services.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);

const LONG_TIMEOUT_MS: u32 = 60000;

/// A selector-driven upstream.
struct Upstream {
    service: &'static str,
    name: &'static str,
    container_url: &'static str,
    host: &'static str,
    /// Upstream path and host port used for `localhost` selectors.
    local: Option<(&'static str, u16)>,
    /// Settings key holding the URL used for the `external` selector.
    external: Option<&'static str>,
    extras: fn(GatewayService) -> GatewayService,
}

const UPSTREAMS: &[Upstream] = &[
    Upstream {
        service: "comfyui",
        name: "comfyui-api",
        container_url: "http://comfyui:18188/",
        host: "comfyui.localhost",
        local: Some(("/", 8000)),
        external: Some("COMFYUI_EXTERNAL_URL"),
        extras: no_extras,
    },
    Upstream {
        service: "n8n",
        name: "n8n-api",
        container_url: "http://n8n:5678/",
        host: "n8n.localhost",
        local: None,
        external: None,
        extras: workflow_extras,
    },
    Upstream {
        service: "searxng",
        name: "searxng-api",
        container_url: "http://searxng:8080/",
        host: "search.localhost",
        local: None,
        external: None,
        extras: search_extras,
    },
    Upstream {
        service: "jupyterhub",
        name: "jupyterhub-api",
        container_url: "http://jupyterhub:8888/",
        host: "jupyter.localhost",
        local: None,
        external: None,
        extras: no_extras,
    },
    Upstream {
        service: "backend",
        name: "backend-api",
        container_url: "http://backend:8000/",
        host: "api.localhost",
        local: None,
        external: None,
        extras: no_extras,
    },
    Upstream {
        service: "open-web-ui",
        name: "openwebui-api",
        container_url: "http://open-web-ui:8080/",
        host: "chat.localhost",
        local: None,
        external: None,
        extras: no_extras,
    },
];

fn no_extras(service: GatewayService) -> GatewayService {
    service
}

fn workflow_extras(mut service: GatewayService) -> GatewayService {
    service.connect_timeout = Some(LONG_TIMEOUT_MS);
    service.write_timeout = Some(LONG_TIMEOUT_MS);
    service.read_timeout = Some(LONG_TIMEOUT_MS);
    for route in &mut service.routes {
        route.preserve_host = Some(true);
    }
    service.with_plugin(Plugin::with_config(
        "request-transformer",
        json!({ "add": { "headers": ["X-Forwarded-Host: n8n.localhost:${KONG_HTTP_PORT}"] } }),
    ))
}

fn search_extras(service: GatewayService) -> GatewayService {
    service.with_plugin(Plugin::with_config(
        "rate-limiting",
        json!({ "minute": 60, "hour": 1000, "policy": "local" }),
    ))
}

/// Generated table plus the entries that could not be built.
#[derive(Debug)]
pub struct Generated {
    pub document: GatewayDocument,
    pub errors: Vec<Error>,
}

pub struct GatewayGenerator<P: PortProbe> {
    probe: P,
    loopback_host: String,
}

impl GatewayGenerator<TcpProbe> {
    pub fn with_tcp_probe(loopback_host: impl Into<String>) -> Self {
        Self::new(
            TcpProbe {
                timeout: REACHABILITY_TIMEOUT,
            },
            loopback_host,
        )
    }
}

impl<P: PortProbe> GatewayGenerator<P> {
    pub fn new(probe: P, loopback_host: impl Into<String>) -> Self {
        Self {
            probe,
            loopback_host: loopback_host.into(),
        }
    }

    /// Always-on platform entries, then one entry per enabled selector-driven
    /// upstream. A failing entry is reported and left out.
    pub fn generate(
        &self,
        sources: &SourceMap,
        settings: &SettingsMap,
        disabled: &BTreeSet<String>,
    ) -> Generated {
        let mut document = GatewayDocument {
            consumers: consumers(),
            services: platform_services(),
            ..Default::default()
        };
        let mut errors = Vec::new();

        for upstream in UPSTREAMS {
            let source = sources
                .get(&source_variable(upstream.service))
                .map(String::as_str)
                .unwrap_or("");
            if source == "disabled" || disabled.contains(upstream.service) {
                debug!("gateway: {} omitted ({})", upstream.name, source);
                continue;
            }
            match self.upstream_url(upstream, source, settings) {
                Ok(url) => {
                    let service = GatewayService::new(upstream.name, &url)
                        .with_host(upstream.host)
                        .with_plugin(Plugin::cors());
                    document.services.push((upstream.extras)(service));
                }
                Err(err) => {
                    warn!("{}", err);
                    errors.push(err);
                }
            }
        }

        Generated { document, errors }
    }

    fn upstream_url(
        &self,
        upstream: &Upstream,
        source: &str,
        settings: &SettingsMap,
    ) -> Result<String, Error> {
        let fail = |reason: String| Error::Gateway {
            entry: upstream.name.to_string(),
            reason,
        };

        if is_local(source) {
            if let Some((path, port)) = upstream.local {
                if !self.probe.in_use(port) {
                    warn!(
                        "{} is not reachable on localhost:{}; the route is written anyway",
                        upstream.service, port
                    );
                }
                return Ok(format!("http://{}:{}{}", self.loopback_host, port, path));
            }
        }

        if source == "external" {
            if let Some(var) = upstream.external {
                let raw = settings
                    .get(var)
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| fail(format!("source is 'external' but {} is not set", var)))?;
                let parsed = Url::parse(raw).map_err(|e| fail(format!("{} is not a URL: {}", var, e)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(fail(format!(
                        "{} must use http or https, got '{}'",
                        var,
                        parsed.scheme()
                    )));
                }
                return Ok(raw.to_string());
            }
        }

        Ok(upstream.container_url.to_string())
    }
}

fn is_local(source: &str) -> bool {
    source == "localhost" || source.ends_with("-localhost")
}

fn consumers() -> Vec<Consumer> {
    vec![Consumer {
        username: "dashboard_user".to_string(),
        basicauth_credentials: vec![Credential {
            username: "${DASHBOARD_USERNAME}".to_string(),
            password: "${DASHBOARD_PASSWORD}".to_string(),
        }],
    }]
}

/// In-cluster platform services; present regardless of selectors.
fn platform_services() -> Vec<GatewayService> {
    let open = |name: &str, url: &str, path: &str| {
        GatewayService::new(name, url)
            .with_path(name, path)
            .with_plugin(Plugin::cors())
    };
    let keyed = |name: &str, route: &str, url: &str, path: &str| {
        GatewayService::new(name, url)
            .with_path(route, path)
            .with_plugin(Plugin::cors())
            .with_plugin(Plugin::key_auth())
    };

    let mut realtime_ws = open("realtime-v1-ws", "http://supabase-realtime:4000/socket", "/realtime/v1/");
    realtime_ws.protocol = Some("ws".to_string());
    let mut realtime_rest = keyed(
        "realtime-v1-rest",
        "realtime-v1-rest",
        "http://supabase-realtime:4000/api",
        "/realtime/v1/api/",
    );
    realtime_rest.protocol = Some("http".to_string());

    let meta = GatewayService::new("meta", "http://supabase-meta:8080/")
        .with_path("meta-all", "/pg/")
        .with_plugin(Plugin::cors())
        .with_plugin(Plugin::named("basic-auth"))
        .with_plugin(Plugin::with_config("acl", json!({ "allow": ["dashboard_user"] })));

    let mut dashboard = GatewayService::new("dashboard", "http://supabase-studio:3000/")
        .with_path("dashboard-all", "/")
        .with_plugin(Plugin::cors());
    for route in &mut dashboard.routes {
        route.strip_path = false;
    }

    vec![
        open("auth-v1-open", "http://supabase-auth:9999/verify", "/auth/v1/verify"),
        open("auth-v1-open-callback", "http://supabase-auth:9999/callback", "/auth/v1/callback"),
        open("auth-v1-open-authorize", "http://supabase-auth:9999/authorize", "/auth/v1/authorize"),
        keyed("auth-v1", "auth-v1-all", "http://supabase-auth:9999/", "/auth/v1/"),
        keyed("rest-v1", "rest-v1-all", "http://supabase-api:3000/", "/rest/v1/"),
        keyed("graphql-v1", "graphql-v1-all", "http://supabase-api:3000/rpc/graphql", "/graphql/v1/"),
        realtime_ws,
        realtime_rest,
        keyed("storage-v1", "storage-v1-all", "http://supabase-storage:5000/", "/storage/v1/"),
        meta,
        dashboard,
    ]
}
