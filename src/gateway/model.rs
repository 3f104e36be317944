//! Serialized shape of the routing document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FORMAT_VERSION: &str = "2.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayDocument {
    #[serde(rename = "_format_version")]
    pub format_version: String,

    #[serde(rename = "_transform")]
    pub transform: bool,

    pub consumers: Vec<Consumer>,
    pub services: Vec<GatewayService>,
}

impl Default for GatewayDocument {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            transform: true,
            consumers: Vec::new(),
            services: Vec::new(),
        }
    }
}

impl GatewayDocument {
    pub fn service(&self, name: &str) -> Option<&GatewayService> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    pub username: String,
    pub basicauth_credentials: Vec<Credential>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayService {
    pub name: String,
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<u32>,

    pub routes: Vec<Route>,
    pub plugins: Vec<Plugin>,
}

impl GatewayService {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Single path route named `route_name`.
    pub fn with_path(mut self, route_name: &str, path: &str) -> Self {
        self.routes.push(Route {
            name: route_name.to_string(),
            strip_path: true,
            preserve_host: None,
            hosts: None,
            paths: Some(vec![path.to_string()]),
        });
        self
    }

    /// Single host route `<name>-all`, forwarded with the path intact.
    pub fn with_host(mut self, host: &str) -> Self {
        self.routes.push(Route {
            name: format!("{}-all", self.name),
            strip_path: false,
            preserve_host: None,
            hosts: Some(vec![host.to_string()]),
            paths: None,
        });
        self
    }

    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub strip_path: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_host: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl Plugin {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: None,
        }
    }

    pub fn with_config(name: &str, config: Value) -> Self {
        Self {
            name: name.to_string(),
            config: Some(config),
        }
    }

    pub fn cors() -> Self {
        Self::named("cors")
    }

    pub fn key_auth() -> Self {
        Self::with_config("key-auth", serde_json::json!({ "key_names": ["apikey"] }))
    }
}
