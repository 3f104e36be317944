//! Requires/optional graph built from `service_dependencies`.
//!
//! Nodes are service keys; edges point from a dependent to what it needs.
//! Relationships stay key lookups, never references, so cycles in the
//! declaration cannot create ownership cycles here.

use crate::schema::ServiceSchema;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub requires: BTreeMap<String, Vec<String>>,
    pub optional: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn build(schema: &ServiceSchema) -> Self {
        let mut graph = DependencyGraph::default();
        for (service, spec) in &schema.service_dependencies {
            graph
                .requires
                .insert(service.clone(), normalize(spec.requires.clone()));
            graph
                .optional
                .insert(service.clone(), normalize(spec.optional.clone()));
        }
        graph
    }

    /// Every service mentioned, as dependent or dependency.
    pub fn services(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for (service, deps) in self.requires.iter().chain(self.optional.iter()) {
            out.insert(service.as_str());
            out.extend(deps.iter().map(String::as_str));
        }
        out
    }

    /// First `requires` cycle found, as a path that starts and ends on the
    /// same service.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        // DFS coloring: Temp marks the current recursion stack.
        #[derive(Copy, Clone, PartialEq, Eq)]
        enum Mark {
            Temp,
            Perm,
        }

        fn dfs(
            v: &str,
            edges: &BTreeMap<String, Vec<String>>,
            marks: &mut BTreeMap<String, Mark>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(v) {
                Some(Mark::Perm) => return None,
                Some(Mark::Temp) => {
                    let start = stack.iter().position(|s| s == v).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(v.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(v.to_string(), Mark::Temp);
            stack.push(v.to_string());
            if let Some(kids) = edges.get(v) {
                for k in kids {
                    if let Some(cycle) = dfs(k, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(v.to_string(), Mark::Perm);
            None
        }

        let mut marks = BTreeMap::<String, Mark>::new();
        let mut stack = Vec::<String>::new();
        for service in self.requires.keys() {
            stack.clear();
            if let Some(cycle) = dfs(service, &self.requires, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }
}

fn normalize(mut deps: Vec<String>) -> Vec<String> {
    deps.sort();
    deps.dedup();
    deps
}
