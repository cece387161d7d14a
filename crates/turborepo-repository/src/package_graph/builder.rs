use std::collections::{BTreeMap, HashMap};

use petgraph::graph::NodeIndex;
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_lockfiles::Lockfile;

use super::{
    dep_splitter::{DependencySplitter, WorkspacePackageInfo},
    PackageGraph, PackageInfo, PackageName, PackageNode,
};
use crate::{package_json::PackageJson, package_manager::PackageManager};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate package name '{name}' found at '{first}' and '{second}'")]
    DuplicatePackageNames {
        name: String,
        first: String,
        second: String,
    },
    #[error("package at '{0}' has no name field in its package.json")]
    PackageJsonMissingName(String),
    #[error(transparent)]
    PackageJson(#[from] crate::package_json::Error),
    #[error(transparent)]
    PackageManager(#[from] crate::package_manager::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error("invalid package graph: {0}")]
    InvalidPackageGraph(#[source] turborepo_graph_utils::Error),
    #[error(transparent)]
    Lockfile(#[from] turborepo_lockfiles::Error),
    #[error("manifest parsing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct PackageGraphBuilder<'a> {
    repo_root: &'a AbsoluteSystemPath,
    root_package_json: PackageJson,
    package_manager: PackageManager,
    lockfile: Option<Box<dyn Lockfile>>,
}

impl<'a> PackageGraphBuilder<'a> {
    pub fn new(repo_root: &'a AbsoluteSystemPath, root_package_json: PackageJson) -> Self {
        Self {
            repo_root,
            root_package_json,
            package_manager: PackageManager::Npm,
            lockfile: None,
        }
    }

    pub fn with_package_manager(mut self, package_manager: PackageManager) -> Self {
        self.package_manager = package_manager;
        self
    }

    /// Supplies an already-parsed lockfile instead of reading one from the
    /// repo root.
    pub fn with_lockfile(mut self, lockfile: Option<Box<dyn Lockfile>>) -> Self {
        self.lockfile = lockfile;
        self
    }

    pub async fn build(self) -> Result<PackageGraph, Error> {
        let Self {
            repo_root,
            root_package_json,
            package_manager,
            lockfile,
        } = self;

        // Stage one: discover and parse every workspace manifest. Parsing
        // is the only I/O concurrent with graph construction.
        let manifest_paths = package_manager.get_package_jsons(repo_root, &root_package_json)?;
        let parse_tasks: Vec<_> = manifest_paths
            .into_iter()
            .map(|path| {
                tokio::task::spawn_blocking(move || {
                    PackageJson::load(&path).map(|manifest| (path, manifest))
                })
            })
            .collect();

        let mut packages = HashMap::new();
        insert_package(
            &mut packages,
            PackageName::Root,
            PackageInfo {
                package_json: root_package_json.clone(),
                package_json_path: AnchoredSystemPathBuf::from_raw("package.json")?,
                unresolved_external_dependencies: None,
                transitive_dependencies: None,
            },
        )?;

        for task in parse_tasks {
            let (path, manifest) = task.await??;
            let name = manifest
                .name
                .clone()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| Error::PackageJsonMissingName(path.to_string()))?;
            let package_json_path = repo_root.anchor(&path)?;
            insert_package(
                &mut packages,
                PackageName::Other(name),
                PackageInfo {
                    package_json: manifest,
                    package_json_path,
                    unresolved_external_dependencies: None,
                    transitive_dependencies: None,
                },
            )?;
        }
        debug!("found {} packages", packages.len());

        // Stage two: with the full name -> package map known, classify
        // every declared dependency and connect the graph.
        let mut graph = petgraph::Graph::new();
        let mut node_lookup = HashMap::new();
        let root_index = graph.add_node(PackageNode::Root);
        node_lookup.insert(PackageNode::Root, root_index);
        for name in packages.keys() {
            let node = PackageNode::Workspace(name.clone());
            let index = graph.add_node(node.clone());
            node_lookup.insert(node, index);
        }

        let workspace_infos: HashMap<String, WorkspacePackageInfo> = packages
            .iter()
            .filter(|(name, _)| !matches!(name, PackageName::Root))
            .map(|(name, info)| {
                (
                    info.package_json
                        .name
                        .clone()
                        .expect("non-root packages are named"),
                    WorkspacePackageInfo {
                        name: name.clone(),
                        version: info.package_json.version.clone().unwrap_or_default(),
                    },
                )
            })
            .collect();

        let mut external_deps: HashMap<PackageName, BTreeMap<String, String>> = HashMap::new();
        for (name, info) in &packages {
            let node_index = node_lookup[&PackageNode::Workspace(name.clone())];
            let package_dir = repo_root.resolve(info.package_path());
            let splitter = DependencySplitter::new(repo_root, &package_dir, &workspace_infos);

            let mut internal_count = 0;
            let mut externals = BTreeMap::new();
            for (dep_name, dep_range) in info.package_json.all_dependencies() {
                match splitter.is_internal(dep_name, dep_range) {
                    // The root package cannot depend on its own workspace
                    // members through the graph; it is the sink.
                    Some(internal) if !matches!(name, PackageName::Root) => {
                        let dep_index = node_lookup[&PackageNode::Workspace(internal)];
                        graph.add_edge(node_index, dep_index, ());
                        internal_count += 1;
                    }
                    Some(_) => {}
                    None => {
                        externals.insert(dep_name.to_string(), dep_range.to_string());
                    }
                }
            }
            if internal_count == 0 {
                graph.add_edge(node_index, root_index, ());
            }
            external_deps.insert(name.clone(), externals);
        }

        for (name, externals) in external_deps {
            if let Some(info) = packages.get_mut(&name) {
                info.unresolved_external_dependencies = Some(externals);
            }
        }

        let lockfile = match lockfile {
            Some(lockfile) => Some(lockfile),
            None => match package_manager.read_lockfile(repo_root) {
                Ok(lockfile) => lockfile,
                Err(e) => {
                    warn!("unable to read lockfile: {e}");
                    None
                }
            },
        };

        if let Some(lockfile) = lockfile.as_deref() {
            populate_transitive_dependencies(&mut packages, lockfile);
        }

        let package_graph = PackageGraph {
            graph,
            node_lookup,
            packages,
            package_manager,
            lockfile,
        };
        package_graph.validate()?;
        Ok(package_graph)
    }
}

fn insert_package(
    packages: &mut HashMap<PackageName, PackageInfo>,
    name: PackageName,
    info: PackageInfo,
) -> Result<(), Error> {
    if let Some(existing) = packages.get(&name) {
        return Err(Error::DuplicatePackageNames {
            name: name.to_string(),
            first: existing.package_json_path.to_string(),
            second: info.package_json_path.to_string(),
        });
    }
    packages.insert(name, info);
    Ok(())
}

fn populate_transitive_dependencies(
    packages: &mut HashMap<PackageName, PackageInfo>,
    lockfile: &dyn Lockfile,
) {
    let workspaces: HashMap<String, HashMap<String, String>> = packages
        .values()
        .map(|info| {
            (
                info.package_path().to_unix().into_string(),
                info.unresolved_external_dependencies
                    .as_ref()
                    .map(|deps| {
                        deps.iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default(),
            )
        })
        .collect();

    let closures = match turborepo_lockfiles::all_transitive_closures(lockfile, workspaces) {
        Ok(closures) => closures,
        Err(e) => {
            // A lockfile that cannot resolve a workspace is treated the
            // same as a missing one: no external fingerprint contribution.
            warn!("unable to calculate external dependency closures: {e}");
            return;
        }
    };

    for info in packages.values_mut() {
        let key = info.package_path().to_unix().into_string();
        info.transitive_dependencies = closures.get(&key).cloned();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    fn write_manifest(root: &AbsoluteSystemPath, dir: &str, contents: &str) {
        let manifest = if dir.is_empty() {
            root.join_component("package.json")
        } else {
            root.join_unix_path(turbopath::RelativeUnixPath::new(dir).unwrap())
                .join_component("package.json")
        };
        manifest.ensure_dir().unwrap();
        manifest.create_with_contents(contents).unwrap();
    }

    fn test_root() -> (tempfile::TempDir, AbsoluteSystemPathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root =
            AbsoluteSystemPathBuf::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        (tmp, root)
    }

    #[tokio::test]
    async fn test_builds_workspace_graph() {
        let (_tmp, root) = test_root();
        write_manifest(
            &root,
            "",
            r#"{"name": "monorepo", "workspaces": ["packages/*", "apps/*"]}"#,
        );
        write_manifest(
            &root,
            "apps/my-app",
            r#"{"name": "my-app", "version": "0.1.0", "dependencies": {"util": "*", "lodash": "^4.0.0"}}"#,
        );
        write_manifest(
            &root,
            "packages/util",
            r#"{"name": "util", "version": "1.0.0"}"#,
        );
        write_manifest(
            &root,
            "packages/another",
            r#"{"name": "another", "version": "1.0.0"}"#,
        );

        let root_manifest = PackageJson::load(&root.join_component("package.json")).unwrap();
        let graph = PackageGraph::builder(&root, root_manifest)
            .build()
            .await
            .unwrap();

        assert_eq!(graph.len(), 4);

        let my_app = PackageNode::Workspace(PackageName::from("my-app"));
        let deps = graph.immediate_dependencies(&my_app).unwrap();
        assert_eq!(
            deps,
            HashSet::from([PackageNode::Workspace(PackageName::from("util"))])
        );

        // lodash is not a workspace member, so it lands in the external set
        let info = graph.package_info(&PackageName::from("my-app")).unwrap();
        let externals = info.unresolved_external_dependencies.as_ref().unwrap();
        assert!(externals.contains_key("lodash"));
        assert!(!externals.contains_key("util"));

        // leaves are attached to the virtual root so it is the sink
        let util = PackageNode::Workspace(PackageName::from("util"));
        assert!(graph.immediate_dependencies(&util).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_package_names_error() {
        let (_tmp, root) = test_root();
        write_manifest(&root, "", r#"{"name": "monorepo", "workspaces": ["packages/*"]}"#);
        write_manifest(&root, "packages/a", r#"{"name": "dupe", "version": "1.0.0"}"#);
        write_manifest(&root, "packages/b", r#"{"name": "dupe", "version": "2.0.0"}"#);

        let root_manifest = PackageJson::load(&root.join_component("package.json")).unwrap();
        let err = PackageGraph::builder(&root, root_manifest)
            .build()
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::DuplicatePackageNames { ref name, .. } if name == "dupe"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_unversioned_range_is_internal() {
        let (_tmp, root) = test_root();
        write_manifest(&root, "", r#"{"name": "monorepo", "workspaces": ["packages/*"]}"#);
        write_manifest(
            &root,
            "packages/a",
            r#"{"name": "a", "version": "1.0.0", "dependencies": {"b": "not-a-range"}}"#,
        );
        write_manifest(&root, "packages/b", r#"{"name": "b", "version": "1.0.0"}"#);

        let root_manifest = PackageJson::load(&root.join_component("package.json")).unwrap();
        let graph = PackageGraph::builder(&root, root_manifest)
            .build()
            .await
            .unwrap();
        let a = PackageNode::Workspace(PackageName::from("a"));
        assert_eq!(
            graph.immediate_dependencies(&a).unwrap(),
            HashSet::from([PackageNode::Workspace(PackageName::from("b"))])
        );
    }

    #[tokio::test]
    async fn test_parallel_mode_erases_edges() {
        let (_tmp, root) = test_root();
        write_manifest(&root, "", r#"{"name": "monorepo", "workspaces": ["packages/*"]}"#);
        write_manifest(
            &root,
            "packages/a",
            r#"{"name": "a", "version": "1.0.0", "dependencies": {"b": "*"}}"#,
        );
        write_manifest(&root, "packages/b", r#"{"name": "b", "version": "1.0.0"}"#);

        let root_manifest = PackageJson::load(&root.join_component("package.json")).unwrap();
        let mut graph = PackageGraph::builder(&root, root_manifest)
            .build()
            .await
            .unwrap();
        graph.remove_package_dependencies();
        let a = PackageNode::Workspace(PackageName::from("a"));
        assert!(graph.immediate_dependencies(&a).unwrap().is_empty());
        graph.validate().unwrap();
    }
}
