//! Schema store: the declarative service schema, loaded fresh every run.
//!
//! It owns:
//! - selector enumerations per service (`source_configurable`, `fixed_services`)
//! - per-selector scale, environment overrides and deploy hints
//! - adaptive (presence-based) services
//! - dependency declarations

pub mod model;

pub use model::{DependencySpec, ServiceClass, ServiceSchema, SourceConfig, source_variable};
