//! The spec dependency graph: loading every reachable spec and ordering
//! them so each builds after the specs it depends on.

use crate::error::{ForgeError, Result};
use crate::spec::{self, ResolvedSpec};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// Every spec reachable from a root spec, with a valid build order.
#[derive(Debug, Clone)]
pub struct DepGraph {
    pub specs: BTreeMap<String, ResolvedSpec>,
    /// Topological order: dependencies come before their dependents
    pub order: Vec<String>,
    pub root: String,
}

impl DepGraph {
    pub fn get(&self, name: &str) -> Option<&ResolvedSpec> {
        self.specs.get(name)
    }

    pub fn root_spec(&self) -> &ResolvedSpec {
        &self.specs[&self.root]
    }

    /// Specs in build order.
    pub fn ordered(&self) -> impl Iterator<Item = &ResolvedSpec> {
        self.order.iter().map(move |name| &self.specs[name])
    }

    /// Names of the specs `name` must be built after.
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.edges().remove(name).unwrap_or_default()
    }

    /// Names of the specs that have `name` as a dependency.
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        self.edges()
            .into_iter()
            .filter(|(_, deps)| deps.contains(name))
            .map(|(dependent, _)| dependent)
            .collect()
    }

    /// dependent -> dependencies, from `@name` froms and `deps` files.
    fn edges(&self) -> BTreeMap<String, BTreeSet<String>> {
        let by_path: HashMap<&Path, &str> = self
            .specs
            .values()
            .map(|s| (s.source_path.as_path(), s.name()))
            .collect();

        self.specs
            .values()
            .map(|s| {
                let mut deps: BTreeSet<String> =
                    s.spec.local_froms().map(str::to_string).collect();
                deps.extend(
                    s.dep_paths()
                        .iter()
                        .filter_map(|p| spec::absolute(p).ok())
                        .filter_map(|p| by_path.get(p.as_path()).map(|n| n.to_string())),
                );
                (s.name().to_string(), deps)
            })
            .collect()
    }

    /// Every `@name` in any spec's froms must name a spec in the graph.
    pub fn validate_deps(&self) -> Result<()> {
        for spec in self.specs.values() {
            for reference in spec.spec.local_froms() {
                if !self.specs.contains_key(reference) {
                    return Err(ForgeError::DanglingLocalFrom {
                        spec: spec.name().to_string(),
                        reference: reference.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over `@name` froms and `deps` edges. Ties are broken
    /// by name so the order is stable across runs.
    fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.specs.keys().map(|k| (k.as_str(), 0)).collect();
        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();

        for (name, deps) in self.edges() {
            for dep in deps.into_iter().filter(|d| self.specs.contains_key(d)) {
                if let Some(degree) = in_degree.get_mut(name.as_str()) {
                    *degree += 1;
                }
                dependents.entry(dep).or_default().insert(name.clone());
            }
        }

        let mut queue: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(n, _)| n.to_string())
            .collect();
        let mut order = Vec::with_capacity(self.specs.len());

        while let Some(name) = queue.pop_front() {
            if let Some(next) = dependents.get(&name) {
                for dependent in next {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            order.push(name);
        }

        let residual: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n.to_string())
            .collect();
        if !residual.is_empty() {
            return Err(ForgeError::DependencyCycle { names: residual });
        }

        Ok(order)
    }
}

/// Load the spec at `root_path` and everything it depends on, validate local
/// references, and compute the build order.
pub fn build_dep_graph(
    root_path: &Path,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<DepGraph> {
    let root_path = spec::absolute(root_path)?;
    let mut loader = Loader {
        lookup,
        by_path: HashMap::new(),
        by_name: BTreeMap::new(),
    };
    loader.load(&root_path, None)?;

    let root = loader
        .by_path
        .get(&root_path)
        .cloned()
        .ok_or_else(|| ForgeError::InvalidSpec {
            path: root_path.clone(),
            reason: "root spec missing from loaded graph".to_string(),
        })?;

    let mut graph = DepGraph {
        specs: loader.by_name,
        order: Vec::new(),
        root,
    };
    graph.validate_deps()?;
    graph.order = graph.topological_order()?;

    tracing::debug!(
        root = %graph.root,
        specs = graph.specs.len(),
        order = ?graph.order,
        "dependency graph built"
    );
    Ok(graph)
}

struct Loader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
    by_path: HashMap<PathBuf, String>,
    by_name: BTreeMap<String, ResolvedSpec>,
}

impl Loader<'_> {
    /// Depth-first load keyed by absolute path, so diamonds load once and
    /// `deps` loops terminate.
    fn load(&mut self, path: &Path, requested_by: Option<&Path>) -> Result<()> {
        if self.by_path.contains_key(path) {
            return Ok(());
        }
        if !path.is_file() {
            return Err(match requested_by {
                Some(parent) => ForgeError::MissingDependency {
                    spec: parent.to_path_buf(),
                    dep: path.to_path_buf(),
                },
                None => ForgeError::InvalidSpec {
                    path: path.to_path_buf(),
                    reason: "spec file not found".to_string(),
                },
            });
        }

        let resolved = ResolvedSpec::load(path, self.lookup)?;
        let name = resolved.name().to_string();

        if let Some(existing) = self.by_name.get(&name) {
            return Err(ForgeError::NameCollision {
                name,
                first: existing.source_path.clone(),
                second: resolved.source_path.clone(),
            });
        }

        let deps = resolved.dep_paths();
        let source_path = resolved.source_path.clone();
        self.by_path.insert(source_path.clone(), name.clone());
        self.by_name.insert(name, resolved);

        for dep in deps {
            let dep = spec::absolute(&dep)?;
            self.load(&dep, Some(&source_path))?;
        }
        Ok(())
    }
}
