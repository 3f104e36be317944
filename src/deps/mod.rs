//! Dependency resolver: requires/optional graph over service keys, checked
//! against current enablement and repaired by disabling dependents.

pub mod graph;
pub mod resolve;

pub use graph::DependencyGraph;
pub use resolve::{DependencyResolver, Resolution, Violation, enabled, mirrors_of, scale_variable};
