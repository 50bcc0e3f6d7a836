//! Compose project files: project name lookup and service start order.

use crate::utils::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Project files copied verbatim into a project backup.
pub const PROJECT_FILES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "docker-compose.override.yml",
    ".env",
];

/// Files that may carry the service graph, in lookup order.
const DEFINITION_FILES: [&str; 2] = ["docker-compose.yml", "docker-compose.yaml"];

#[derive(Debug, Default, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    services: Option<BTreeMap<String, Option<ServiceDef>>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceDef {
    #[serde(default)]
    depends_on: Option<DependsOn>,
}

/// `depends_on` comes as a plain list or as a map of service to condition.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl DependsOn {
    fn names(&self) -> Vec<String> {
        match self {
            DependsOn::List(names) => names.clone(),
            DependsOn::Map(map) => map.keys().cloned().collect(),
        }
    }
}

impl ProjectFile {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(data)?)
    }

    /// Service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        self.services
            .as_ref()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Each service mapped to the services it depends on.
    pub fn dependency_graph(&self) -> BTreeMap<String, Vec<String>> {
        self.services
            .iter()
            .flatten()
            .map(|(name, def)| {
                let deps = def
                    .as_ref()
                    .and_then(|d| d.depends_on.as_ref())
                    .map(DependsOn::names)
                    .unwrap_or_default();
                (name.clone(), deps)
            })
            .collect()
    }

    pub fn start_order(&self) -> Vec<String> {
        resolve_order(&self.dependency_graph())
    }
}

/// Order services so every service comes after the ones it depends on.
///
/// Kahn's algorithm, always taking the lexicographically smallest ready
/// service, so equal inputs give equal outputs. When some service can never
/// become ready (a cycle, or a dependency on an undeclared service) the
/// result is every service in alphabetical order instead. Never fails.
pub fn resolve_order(graph: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = graph.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (service, deps) in graph {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(service.as_str());
            *in_degree.entry(service.as_str()).or_default() += 1;
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(s, _)| *s)
        .collect();
    let mut order = Vec::with_capacity(graph.len());

    while let Some(current) = ready.pop_first() {
        order.push(current.to_string());
        for &next in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() < graph.len() {
        return graph.keys().cloned().collect();
    }
    order
}

/// First project definition file present in `dir`.
pub fn find_definition(dir: &Path) -> Option<PathBuf> {
    DEFINITION_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Project name: the explicit one, else the definition's `name:` key, else
/// the project directory's base name.
pub fn resolve_project_name(explicit: Option<&str>, project_dir: &Path) -> String {
    if let Some(name) = explicit.filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    let declared = find_definition(project_dir)
        .and_then(|path| std::fs::read(path).ok())
        .and_then(|data| ProjectFile::parse(&data).ok())
        .and_then(|file| file.name)
        .filter(|n| !n.is_empty());
    if let Some(name) = declared {
        return name;
    }

    let dir = project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf());
    crate::fs::paths::base_name(&dir)
}
