//! Dependency extraction — an API-layer responsibility the Scheduler never
//! performs itself (SPEC_FULL.md §4.4). The real variable-substitution /
//! YAML layer is out of scope; this module extracts a `depends_on` array
//! already present on each submitted package spec and validates the
//! resulting graph is acyclic.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{ServiceError, ServiceResult};

/// Computes `dependsOn` for a set of packages from their raw specs.
pub trait DependencyExtractor: Send + Sync {
    fn extract(&self, name: &str, spec: &serde_json::Value) -> BTreeSet<String>;
}

/// Reads an explicit `depends_on: [name, ...]` array off the spec JSON.
/// Names not present anywhere in the submitted build are left as-is; the
/// caller validates referential integrity separately.
pub struct FieldDependencyExtractor;

impl DependencyExtractor for FieldDependencyExtractor {
    fn extract(&self, _name: &str, spec: &serde_json::Value) -> BTreeSet<String> {
        spec.get("depends_on")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Validates that every `dependsOn` name refers to a package in the same
/// build and that the resulting graph has no cycle, per SPEC_FULL.md §9
/// ("If a submitted graph contains a cycle, the API must reject it with
/// BadRequest").
pub fn validate_dag(names: &[String], depends_on: &HashMap<String, BTreeSet<String>>) -> ServiceResult<()> {
    let known: HashSet<&str> = names.iter().map(String::as_str).collect();
    for (name, deps) in depends_on {
        for dep in deps {
            if !known.contains(dep.as_str()) {
                return Err(ServiceError::BadRequest(format!(
                    "package {name} depends on unknown package {dep}"
                )));
            }
        }
    }

    // DFS cycle detection.
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        node: &'a str,
        depends_on: &'a HashMap<String, BTreeSet<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> ServiceResult<()> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(ServiceError::BadRequest(format!(
                    "dependency cycle detected at package {node}"
                )))
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(deps) = depends_on.get(node) {
            for dep in deps {
                visit(dep.as_str(), depends_on, marks)?;
            }
        }
        marks.insert(node, Mark::Done);
        Ok(())
    }

    for name in names {
        visit(name.as_str(), depends_on, &mut marks)?;
    }
    Ok(())
}
