//! Dependency resolution over plugin descriptors
//!
//! Edges point from a plugin to the plugins it depends on. Load order is a
//! topological sort (Kahn) in which ties between ready plugins are broken by
//! descriptor priority, lower first, then by id.

use crate::version::{parse_requirement, parse_version};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use thiserror::Error;
use warden_api::{DependencySpec, PluginDescriptor, PluginRecord, PluginState};

/// Which dependency edges to follow when looking for dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyScope {
    /// Only non-optional dependencies
    Required,
    /// Required and optional dependencies
    All,
}

/// Why a single plugin cannot be loaded or started
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyFailure {
    #[error("required dependency '{dependency}' is not available")]
    Missing { dependency: String },

    #[error("dependency '{dependency}' version {found} does not satisfy '{requirement}'")]
    Unsatisfied {
        dependency: String,
        requirement: String,
        found: String,
    },

    #[error("dependency '{dependency}' failed to resolve")]
    DependencyFailed { dependency: String },

    #[error("dependency '{dependency}' is {state}, not STARTED")]
    NotRunning {
        dependency: String,
        state: PluginState,
    },

    #[error("invalid requirement on '{dependency}': {reason}")]
    InvalidRequirement { dependency: String, reason: String },
}

/// Errors that abort a whole resolution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Members of the dependency cycle(s), sorted
    #[error("dependency cycle between: {}", members.join(", "))]
    Cycle { members: Vec<String> },
}

/// Result of [`resolve_load_order`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    /// Plugins that can be loaded, dependencies first
    pub order: Vec<String>,
    /// Plugins excluded from `order` and why
    pub failed: BTreeMap<String, DependencyFailure>,
}

impl LoadPlan {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ids of plugins whose descriptor depends on `plugin_id`
pub fn dependents_of<'a>(
    plugin_id: &str,
    descriptors: impl IntoIterator<Item = &'a PluginDescriptor>,
    scope: DependencyScope,
) -> BTreeSet<String> {
    descriptors
        .into_iter()
        .filter(|d| d.plugin_id != plugin_id)
        .filter(|d| {
            d.dependencies.iter().any(|dep| {
                dep.plugin_id == plugin_id
                    && (scope == DependencyScope::All || !dep.optional)
            })
        })
        .map(|d| d.plugin_id.clone())
        .collect()
}

/// Order `candidates` so every plugin follows its dependencies.
///
/// `available` maps ids that are already present outside the candidate set to
/// their versions; they satisfy dependencies without being ordered. A plugin
/// with a missing or unsatisfied required dependency is reported in
/// [`LoadPlan::failed`], as is every plugin that transitively requires it.
/// Unrelated plugins are unaffected. A cycle fails the whole resolution.
pub fn resolve_load_order(
    candidates: &[PluginDescriptor],
    available: &HashMap<String, String>,
) -> Result<LoadPlan, ResolveError> {
    let nodes: BTreeMap<&str, &PluginDescriptor> = candidates
        .iter()
        .map(|d| (d.plugin_id.as_str(), d))
        .collect();

    let mut failed: BTreeMap<String, DependencyFailure> = BTreeMap::new();
    // dependency -> dependents, restricted to candidates
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = nodes.keys().map(|id| (*id, 0)).collect();

    for (id, desc) in &nodes {
        for dep in &desc.dependencies {
            if dep.plugin_id == *id {
                continue;
            }
            let found = nodes
                .get(dep.plugin_id.as_str())
                .map(|d| d.version.as_str())
                .or_else(|| available.get(&dep.plugin_id).map(String::as_str));

            if let Some(failure) = check_spec(dep, found) {
                if dep.optional {
                    tracing::debug!(
                        plugin = %id,
                        dependency = %dep.plugin_id,
                        reason = %failure,
                        "Ignoring optional dependency"
                    );
                } else if !failed.contains_key(*id) {
                    failed.insert(id.to_string(), failure);
                }
            }

            if let Some((dep_id, _)) = nodes.get_key_value(dep.plugin_id.as_str()) {
                dependents.entry(*dep_id).or_default().push(*id);
                if let Some(degree) = in_degree.get_mut(*id) {
                    *degree += 1;
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(i32, &str)>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse((nodes[id].priority, *id)))
        .collect();

    let mut sorted: Vec<&str> = Vec::with_capacity(nodes.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        sorted.push(id);
        for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((nodes[dependent].priority, *dependent)));
                }
            }
        }
    }

    if sorted.len() < nodes.len() {
        let leftover: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| *id)
            .collect();
        let members = cycle_members(&nodes, leftover);
        tracing::warn!(members = ?members, "Dependency cycle detected");
        return Err(ResolveError::Cycle { members });
    }

    // Dependencies come first in `sorted`, so one pass propagates failure
    let mut order = Vec::with_capacity(sorted.len());
    for id in sorted {
        if failed.contains_key(id) {
            continue;
        }
        let broken = nodes[id]
            .required_dependencies()
            .find(|dep| failed.contains_key(&dep.plugin_id));
        match broken {
            Some(dep) => {
                failed.insert(
                    id.to_string(),
                    DependencyFailure::DependencyFailed {
                        dependency: dep.plugin_id.clone(),
                    },
                );
            }
            None => order.push(id.to_string()),
        }
    }

    Ok(LoadPlan { order, failed })
}

/// Check that every required dependency of `descriptor` is registered, has a
/// matching version and is running.
pub fn check_dependencies(
    descriptor: &PluginDescriptor,
    registered: &[PluginRecord],
) -> Result<(), DependencyFailure> {
    for dep in descriptor.required_dependencies() {
        let record = registered
            .iter()
            .find(|r| r.plugin_id() == dep.plugin_id && r.state != PluginState::Unloaded);
        let Some(record) = record else {
            return Err(DependencyFailure::Missing {
                dependency: dep.plugin_id.clone(),
            });
        };
        if let Some(failure) = check_spec(dep, Some(record.version())) {
            return Err(failure);
        }
        if record.state != PluginState::Started {
            return Err(DependencyFailure::NotRunning {
                dependency: dep.plugin_id.clone(),
                state: record.state,
            });
        }
    }
    Ok(())
}

fn check_spec(dep: &DependencySpec, found: Option<&str>) -> Option<DependencyFailure> {
    let requirement = match parse_requirement(&dep.version_requirement) {
        Ok(req) => req,
        Err(e) => {
            return Some(DependencyFailure::InvalidRequirement {
                dependency: dep.plugin_id.clone(),
                reason: e.to_string(),
            })
        }
    };
    let Some(found) = found else {
        return Some(DependencyFailure::Missing {
            dependency: dep.plugin_id.clone(),
        });
    };
    let matches = parse_version(found)
        .map(|v| requirement.matches(&v))
        .unwrap_or(false);
    (!matches).then(|| DependencyFailure::Unsatisfied {
        dependency: dep.plugin_id.clone(),
        requirement: dep.version_requirement.clone(),
        found: found.to_string(),
    })
}

/// Reduce the nodes Kahn could not emit to those on a cycle.
///
/// Plugins that merely depend on a cycle are pruned by repeatedly removing
/// leftover nodes that no other leftover node depends on.
fn cycle_members(
    nodes: &BTreeMap<&str, &PluginDescriptor>,
    mut leftover: BTreeSet<&str>,
) -> Vec<String> {
    loop {
        let depended_on: BTreeSet<&str> = leftover
            .iter()
            .flat_map(|id| nodes[id].dependencies.iter())
            .map(|dep| dep.plugin_id.as_str())
            .filter(|dep| leftover.contains(dep))
            .collect();
        let before = leftover.len();
        leftover.retain(|id| depended_on.contains(id));
        if leftover.len() == before {
            break;
        }
    }
    leftover.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: &str) -> PluginDescriptor {
        PluginDescriptor::new(id, "1.0.0", format!("{id}.wasm"))
    }

    fn position(plan: &LoadPlan, id: &str) -> usize {
        plan.order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_dependencies_come_first() {
        let plugins = vec![
            desc("app").depends_on("db", ">=1.0.0 <2.0.0").depends_on("log", "*"),
            desc("db").depends_on("log", "^1"),
            desc("log"),
        ];
        let plan = resolve_load_order(&plugins, &HashMap::new()).unwrap();
        assert!(plan.is_complete());
        assert_eq!(plan.order, vec!["log", "db", "app"]);
    }

    #[test]
    fn test_priority_breaks_ties() {
        let plugins = vec![
            desc("c").priority(5),
            desc("a").priority(10),
            desc("b").priority(-1),
        ];
        let plan = resolve_load_order(&plugins, &HashMap::new()).unwrap();
        assert_eq!(plan.order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_two_node_cycle_names_both() {
        let plugins = vec![desc("a").depends_on("b", "*"), desc("b").depends_on("a", "*")];
        let err = resolve_load_order(&plugins, &HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            ResolveError::Cycle {
                members: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn test_cycle_report_excludes_dependents_of_cycle() {
        let plugins = vec![
            desc("a").depends_on("b", "*"),
            desc("b").depends_on("c", "*"),
            desc("c").depends_on("a", "*"),
            desc("top").depends_on("a", "*"),
            desc("free"),
        ];
        let ResolveError::Cycle { members } =
            resolve_load_order(&plugins, &HashMap::new()).unwrap_err();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_required_fails_only_dependents() {
        let plugins = vec![
            desc("needs-ghost").depends_on("ghost", "*"),
            desc("above").depends_on("needs-ghost", "*"),
            desc("independent"),
        ];
        let plan = resolve_load_order(&plugins, &HashMap::new()).unwrap();
        assert_eq!(plan.order, vec!["independent"]);
        assert_eq!(
            plan.failed["needs-ghost"],
            DependencyFailure::Missing {
                dependency: "ghost".into()
            }
        );
        assert_eq!(
            plan.failed["above"],
            DependencyFailure::DependencyFailed {
                dependency: "needs-ghost".into()
            }
        );
    }

    #[test]
    fn test_optional_dependency_orders_but_may_be_absent() {
        let plugins = vec![
            desc("ui").optionally_depends_on("theme", "*").optionally_depends_on("ghost", "*"),
            desc("theme").priority(100),
        ];
        let plan = resolve_load_order(&plugins, &HashMap::new()).unwrap();
        assert!(plan.is_complete());
        assert!(position(&plan, "theme") < position(&plan, "ui"));
    }

    #[test]
    fn test_version_mismatch_against_available() {
        let available = HashMap::from([("core".to_string(), "2.1.0".to_string())]);
        let plugins = vec![
            desc("old").depends_on("core", ">=1.0.0 <2.0.0"),
            desc("new").depends_on("core", ">=2.0.0"),
        ];
        let plan = resolve_load_order(&plugins, &available).unwrap();
        assert_eq!(plan.order, vec!["new"]);
        assert!(matches!(
            plan.failed["old"],
            DependencyFailure::Unsatisfied { .. }
        ));
    }

    #[test]
    fn test_invalid_requirement_is_reported() {
        let plugins = vec![desc("a").depends_on("b", ">= >="), desc("b")];
        let plan = resolve_load_order(&plugins, &HashMap::new()).unwrap();
        assert!(matches!(
            plan.failed["a"],
            DependencyFailure::InvalidRequirement { .. }
        ));
    }

    #[test]
    fn test_dependents_of_scopes() {
        let plugins = vec![
            desc("hard").depends_on("base", "*"),
            desc("soft").optionally_depends_on("base", "*"),
            desc("base"),
        ];
        let required = dependents_of("base", &plugins, DependencyScope::Required);
        assert_eq!(required, BTreeSet::from(["hard".to_string()]));
        let all = dependents_of("base", &plugins, DependencyScope::All);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_check_dependencies_requires_running_dependency() {
        let base = desc("base");
        let app = desc("app").depends_on("base", "^1.0");

        let mut record = PluginRecord::new(base, "/tmp/base");
        record.state = PluginState::Stopped;
        assert_eq!(
            check_dependencies(&app, std::slice::from_ref(&record)),
            Err(DependencyFailure::NotRunning {
                dependency: "base".into(),
                state: PluginState::Stopped
            })
        );

        record.state = PluginState::Started;
        assert_eq!(check_dependencies(&app, &[record]), Ok(()));
        assert!(matches!(
            check_dependencies(&app, &[]),
            Err(DependencyFailure::Missing { .. })
        ));
    }
}
