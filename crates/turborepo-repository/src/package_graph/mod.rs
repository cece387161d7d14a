mod builder;
mod dep_splitter;

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use turbopath::{AnchoredSystemPath, AnchoredSystemPathBuf};
use turborepo_lockfiles::Lockfile;

pub use builder::{Error, PackageGraphBuilder};

use crate::{package_json::PackageJson, package_manager::PackageManager};

pub const ROOT_PKG_NAME: &str = "//";

/// A package's name in the workspace. The synthetic root package has the
/// reserved name `//` and may define tasks but has no siblings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageName {
    Root,
    Other(String),
}

impl PackageName {
    pub fn as_str(&self) -> &str {
        match self {
            PackageName::Root => ROOT_PKG_NAME,
            PackageName::Other(name) => name,
        }
    }
}

impl From<&str> for PackageName {
    fn from(name: &str) -> Self {
        if name == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(name.to_string())
        }
    }
}

impl From<String> for PackageName {
    fn from(name: String) -> Self {
        if name == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(name)
        }
    }
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PackageName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A vertex in the package graph: a workspace package, or the virtual sink
/// every leaf connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageNode {
    Root,
    Workspace(PackageName),
}

impl PackageNode {
    pub fn as_package_name(&self) -> &PackageName {
        match self {
            PackageNode::Root => &PackageName::Root,
            PackageNode::Workspace(name) => name,
        }
    }
}

impl std::fmt::Display for PackageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageNode::Root => f.write_str("___ROOT___"),
            PackageNode::Workspace(name) => name.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageInfo {
    pub package_json: PackageJson,
    pub package_json_path: AnchoredSystemPathBuf,
    /// The direct external (registry) dependencies of this package, as
    /// declared. `None` until dependency classification has run.
    pub unresolved_external_dependencies: Option<std::collections::BTreeMap<String, String>>,
    /// Every lockfile key reachable from the direct external dependencies.
    /// `None` when no lockfile was available.
    #[serde(skip)]
    pub transitive_dependencies: Option<HashSet<turborepo_lockfiles::Package>>,
}

impl PackageInfo {
    /// The package's directory, anchored at the repo root.
    pub fn package_path(&self) -> &AnchoredSystemPath {
        self.package_json_path
            .parent()
            .unwrap_or_else(|| AnchoredSystemPath::new("").expect("empty path is anchored"))
    }
}

pub struct PackageGraph {
    graph: petgraph::Graph<PackageNode, ()>,
    node_lookup: HashMap<PackageNode, petgraph::graph::NodeIndex>,
    packages: HashMap<PackageName, PackageInfo>,
    package_manager: PackageManager,
    lockfile: Option<Box<dyn Lockfile>>,
}

impl std::fmt::Debug for PackageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageGraph")
            .field("graph", &self.graph)
            .field("node_lookup", &self.node_lookup)
            .field("packages", &self.packages)
            .field("package_manager", &self.package_manager)
            .field("lockfile", &self.lockfile.is_some())
            .finish()
    }
}

impl PackageGraph {
    pub fn builder(
        repo_root: &turbopath::AbsoluteSystemPath,
        root_package_json: PackageJson,
    ) -> PackageGraphBuilder<'_> {
        PackageGraphBuilder::new(repo_root, root_package_json)
    }

    /// Number of workspace packages, the root package included.
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn package_manager(&self) -> PackageManager {
        self.package_manager
    }

    pub fn lockfile(&self) -> Option<&dyn Lockfile> {
        self.lockfile.as_deref()
    }

    pub fn package_info(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn package_json(&self, name: &PackageName) -> Option<&PackageJson> {
        self.packages.get(name).map(|info| &info.package_json)
    }

    pub fn root_package_json(&self) -> &PackageJson {
        &self
            .packages
            .get(&PackageName::Root)
            .expect("graph always contains the root package")
            .package_json
    }

    pub fn packages(&self) -> impl Iterator<Item = (&PackageName, &PackageInfo)> {
        self.packages.iter()
    }

    /// Immediate internal dependencies of `node` (the packages it points
    /// at), excluding the virtual sink.
    pub fn immediate_dependencies(&self, node: &PackageNode) -> Option<HashSet<PackageNode>> {
        let index = self.node_lookup.get(node)?;
        Some(
            self.graph
                .neighbors_directed(*index, petgraph::Direction::Outgoing)
                .map(|dep| self.graph[dep].clone())
                .filter(|dep| !matches!(dep, PackageNode::Root))
                .collect(),
        )
    }

    /// All packages `node` depends on, transitively.
    pub fn dependencies(&self, node: &PackageNode) -> HashSet<&PackageNode> {
        let Some(index) = self.node_lookup.get(node) else {
            return HashSet::new();
        };
        let mut closure = turborepo_graph_utils::transitive_closure(
            &self.graph,
            Some(*index),
            petgraph::Direction::Outgoing,
        );
        closure.remove(node);
        closure.remove(&PackageNode::Root);
        closure
    }

    /// All packages that depend on `node`, transitively.
    pub fn ancestors(&self, node: &PackageNode) -> HashSet<&PackageNode> {
        let Some(index) = self.node_lookup.get(node) else {
            return HashSet::new();
        };
        let mut closure = turborepo_graph_utils::transitive_closure(
            &self.graph,
            Some(*index),
            petgraph::Direction::Incoming,
        );
        closure.remove(node);
        closure
    }

    /// Validates the graph invariants: acyclic, no self-edges.
    pub fn validate(&self) -> Result<(), Error> {
        turborepo_graph_utils::validate_graph(&self.graph).map_err(Error::InvalidPackageGraph)
    }

    /// Erases all package-to-package edges, leaving only edges to the
    /// virtual sink. Supports `--parallel`.
    pub fn remove_package_dependencies(&mut self) {
        let root_index = self
            .node_lookup
            .get(&PackageNode::Root)
            .copied()
            .expect("graph always contains the root node");
        self.graph.clear_edges();
        for (node, index) in &self.node_lookup {
            if !matches!(node, PackageNode::Root) {
                self.graph.add_edge(*index, root_index, ());
            }
        }
    }

    /// Packages whose external-dependency closure differs under a previous
    /// lockfile, plus all packages when the lockfile change is global.
    pub fn changed_packages_from_lockfile(
        &self,
        previous: &dyn Lockfile,
    ) -> Result<Vec<PackageName>, turborepo_lockfiles::Error> {
        let current = self.lockfile().ok_or_else(|| {
            turborepo_lockfiles::Error::MissingPackage("no current lockfile".to_string())
        })?;

        if turborepo_lockfiles::global_change(previous, current) {
            return Ok(self.packages.keys().cloned().collect());
        }

        let mut changed = Vec::new();
        for (name, info) in &self.packages {
            let Some(external) = info.unresolved_external_dependencies.as_ref() else {
                continue;
            };
            let deps: HashMap<String, String> = external
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let workspace_dir = info.package_path().to_unix();
            let previous_closure = turborepo_lockfiles::transitive_closure(
                previous,
                workspace_dir.as_str(),
                deps.clone(),
            );
            let current_closure = turborepo_lockfiles::transitive_closure(
                current,
                workspace_dir.as_str(),
                deps,
            );
            match (previous_closure, current_closure) {
                (Ok(previous_closure), Ok(current_closure)) => {
                    if previous_closure != current_closure {
                        changed.push(name.clone());
                    }
                }
                // A workspace missing from one side means it changed.
                _ => changed.push(name.clone()),
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_name_round_trip() {
        assert_eq!(PackageName::from("//"), PackageName::Root);
        assert_eq!(PackageName::from("ui").to_string(), "ui");
        assert_eq!(PackageName::Root.to_string(), "//");
    }
}
