//! Expansion of the pipeline configuration and target list into the
//! concrete task graph.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use tracing::debug;
use turborepo_repository::package_graph::{PackageGraph, PackageName, PackageNode};

use super::{Building, Engine};
use crate::{
    run::task_id::{TaskId, TaskName, ROOT_PKG_NAME},
    turbo_json::{RawTaskDefinition, TaskDefinition, TurboJson},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "{task_id} is listed as a dependency but no task definition or package exists for it"
    )]
    MissingTaskDependency { task_id: String },
    #[error(transparent)]
    Config(#[from] crate::config::Error),
}

pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    root_turbo_json: &'a TurboJson,
    workspace_turbo_jsons: &'a HashMap<PackageName, TurboJson>,
    filtered_packages: HashSet<PackageName>,
    task_names: Vec<TaskName<'static>>,
    tasks_only: bool,
    parallel: bool,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(
        package_graph: &'a PackageGraph,
        root_turbo_json: &'a TurboJson,
        workspace_turbo_jsons: &'a HashMap<PackageName, TurboJson>,
    ) -> Self {
        Self {
            package_graph,
            root_turbo_json,
            workspace_turbo_jsons,
            filtered_packages: HashSet::new(),
            task_names: Vec::new(),
            tasks_only: false,
            parallel: false,
        }
    }

    pub fn with_workspaces(mut self, packages: impl IntoIterator<Item = PackageName>) -> Self {
        self.filtered_packages = packages.into_iter().collect();
        self
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = TaskName<'static>>) -> Self {
        self.task_names = tasks.into_iter().collect();
        self
    }

    /// `--only`: run exactly the named tasks, without their dependencies.
    pub fn with_tasks_only(mut self, tasks_only: bool) -> Self {
        self.tasks_only = tasks_only;
        self
    }

    /// `--parallel`: erase every edge except those to the root node.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn build(self) -> Result<Engine, Error> {
        let mut engine: Engine<Building> = Engine::new();
        let mut visited: HashSet<TaskId<'static>> = HashSet::new();
        let mut queue: VecDeque<TaskId<'static>> = VecDeque::new();

        // Seed the traversal with (package, target) pairs that actually
        // resolve to a definition; targets without one are skipped, not
        // errors.
        for task_name in &self.task_names {
            for package in &self.filtered_packages {
                let Some(task_id) = task_id_for(package, task_name) else {
                    continue;
                };
                if self.task_definition_raw(&task_id).is_none() {
                    debug!("no definition for {task_id}, skipping");
                    continue;
                }
                if visited.insert(task_id.clone()) {
                    queue.push_back(task_id);
                }
            }
        }

        while let Some(task_id) = queue.pop_front() {
            let definition = self
                .resolved_task_definition(&task_id)?
                .expect("queued tasks have definitions");
            let has_topological_deps = !definition.topological_dependencies.is_empty();
            let has_task_deps = !definition.task_dependencies.is_empty();
            engine.add_definition(task_id.clone(), Arc::new(definition.clone()));

            if self.tasks_only || self.parallel {
                engine.connect_to_root(&task_id);
                continue;
            }

            let mut edge_added = false;

            if has_topological_deps {
                let package_node =
                    PackageNode::Workspace(PackageName::from(task_id.package().to_string()));
                let internal_deps = self
                    .package_graph
                    .immediate_dependencies(&package_node)
                    .unwrap_or_default();
                for topo_dep in &definition.topological_dependencies {
                    for dep_package in &internal_deps {
                        let dep_id = TaskId::from_static(
                            dep_package.as_package_name().to_string(),
                            topo_dep.task().to_string(),
                        );
                        // `^task` fans out only to upstream packages that
                        // define the task.
                        if self.task_definition_raw(&dep_id).is_none() {
                            continue;
                        }
                        engine.connect(&task_id, &dep_id);
                        edge_added = true;
                        if visited.insert(dep_id.clone()) {
                            queue.push_back(dep_id);
                        }
                    }
                }
            }

            if has_task_deps {
                for task_dep in &definition.task_dependencies {
                    let dep_id = match task_dep.package() {
                        Some(package) => TaskId::from_static(
                            package.to_string(),
                            task_dep.task().to_string(),
                        ),
                        None => TaskId::from_static(
                            task_id.package().to_string(),
                            task_dep.task().to_string(),
                        ),
                    };

                    if self.task_definition_raw(&dep_id).is_none() {
                        match task_dep.package() {
                            // A sibling dependency that doesn't exist is
                            // skipped, matching target behavior.
                            None => continue,
                            // Depending on an undefined root task is allowed;
                            // the root package is a wildcard.
                            Some(ROOT_PKG_NAME) => continue,
                            // A fully-qualified dependency must exist.
                            Some(_) => {
                                return Err(Error::MissingTaskDependency {
                                    task_id: dep_id.to_string(),
                                })
                            }
                        }
                    }

                    engine.connect(&task_id, &dep_id);
                    edge_added = true;
                    if visited.insert(dep_id.clone()) {
                        queue.push_back(dep_id);
                    }
                }
            }

            if !edge_added {
                engine.connect_to_root(&task_id);
            }
        }

        Ok(engine.seal())
    }

    /// The raw definition chain for a task id, if any part of it exists.
    fn task_definition_raw(&self, task_id: &TaskId) -> Option<RawTaskDefinition> {
        let task_name = TaskName::from(task_id.task().to_string());
        let package_name = PackageName::from(task_id.package());
        // The package must exist for the task to be schedulable.
        self.package_graph.package_info(&package_name)?;

        // The root package only runs tasks that are explicitly qualified
        // as `//#task`; a bare pipeline entry never schedules on root.
        let root_raw = if matches!(package_name, PackageName::Root) {
            self.root_turbo_json
                .tasks
                .get(&task_id.as_task_name())
                .cloned()
        } else {
            self.root_turbo_json.task(task_id, &task_name)
        };
        let workspace_raw = (!matches!(package_name, PackageName::Root))
            .then(|| {
                self.workspace_turbo_jsons
                    .get(&package_name)
                    .and_then(|turbo_json| turbo_json.task(task_id, &task_name))
            })
            .flatten();

        match (root_raw, workspace_raw) {
            (Some(root), Some(workspace)) => Some(workspace.merge_onto(&root)),
            (Some(root), None) => Some(root),
            (None, Some(workspace)) => Some(workspace),
            (None, None) => None,
        }
    }

    fn resolved_task_definition(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<TaskDefinition>, Error> {
        self.task_definition_raw(task_id)
            .map(|raw| TaskDefinition::try_from(raw).map_err(Error::Config))
            .transpose()
    }
}

/// The concrete task id for a (package, target) pair, unless the target
/// names a different package.
fn task_id_for(package: &PackageName, task_name: &TaskName) -> Option<TaskId<'static>> {
    match task_name.package() {
        Some(task_package) if task_package != package.as_str() => None,
        _ => Some(TaskId::from_static(
            package.to_string(),
            task_name.task().to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use turborepo_repository::{package_graph::PackageGraph, package_json::PackageJson};

    use super::*;
    use crate::{engine::TaskNode, turbo_json::RawTurboJson};

    async fn test_package_graph(tmp: &tempfile::TempDir) -> PackageGraph {
        let root = turbopath::AbsoluteSystemPathBuf::from_std_path(
            &tmp.path().canonicalize().unwrap(),
        )
        .unwrap();
        let write = |dir: &str, contents: &str| {
            let manifest = if dir.is_empty() {
                root.join_component("package.json")
            } else {
                root.join_unix_path(turbopath::RelativeUnixPath::new(dir).unwrap())
                    .join_component("package.json")
            };
            manifest.ensure_dir().unwrap();
            manifest.create_with_contents(contents).unwrap();
        };
        write(
            "",
            r#"{"name": "monorepo", "workspaces": ["packages/*", "apps/*"]}"#,
        );
        write(
            "apps/my-app",
            r#"{"name": "my-app", "version": "0.1.0", "scripts": {"build": "build"}, "dependencies": {"util": "*"}}"#,
        );
        write(
            "packages/util",
            r#"{"name": "util", "version": "1.0.0", "scripts": {"build": "build"}}"#,
        );
        write(
            "packages/another",
            r#"{"name": "another", "version": "1.0.0", "scripts": {"build": "build"}}"#,
        );

        let root_manifest = PackageJson::load(&root.join_component("package.json")).unwrap();
        PackageGraph::builder(&root, root_manifest)
            .build()
            .await
            .unwrap()
    }

    fn turbo_json(content: &str) -> TurboJson {
        let raw: RawTurboJson = serde_json::from_str(content).unwrap();
        TurboJson::try_from(raw).unwrap()
    }

    fn all_packages(graph: &PackageGraph) -> Vec<PackageName> {
        graph.packages().map(|(name, _)| name.clone()).collect()
    }

    #[tokio::test]
    async fn test_topological_expansion() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_package_graph(&tmp).await;
        let root_turbo = turbo_json(r#"{"tasks": {"build": {"dependsOn": ["^build"]}}}"#);
        let workspace_jsons = HashMap::new();

        let engine = EngineBuilder::new(&graph, &root_turbo, &workspace_jsons)
            .with_workspaces(all_packages(&graph))
            .with_tasks(Some(TaskName::from("build")))
            .build()
            .unwrap();

        let app_build = TaskId::new("my-app", "build").into_owned();
        let util_build = TaskId::new("util", "build").into_owned();
        let deps = engine.dependencies(&app_build).unwrap();
        assert!(deps.contains(&TaskNode::Task(util_build.clone())));

        // util has no internal dependencies, so its build attaches to root
        let util_deps = engine.dependencies(&util_build).unwrap();
        assert_eq!(util_deps, HashSet::from([&TaskNode::Root]));

        assert_eq!(engine.len(), 3);
    }

    #[tokio::test]
    async fn test_sibling_and_qualified_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_package_graph(&tmp).await;
        let root_turbo = turbo_json(
            r#"{"tasks": {
                "build": {"dependsOn": ["prepare", "util#codegen"]},
                "prepare": {},
                "util#codegen": {}
            }}"#,
        );
        let workspace_jsons = HashMap::new();

        let engine = EngineBuilder::new(&graph, &root_turbo, &workspace_jsons)
            .with_workspaces(vec![PackageName::from("my-app")])
            .with_tasks(Some(TaskName::from("build")))
            .build()
            .unwrap();

        let app_build = TaskId::new("my-app", "build").into_owned();
        let deps = engine.dependencies(&app_build).unwrap();
        assert!(deps.contains(&TaskNode::Task(TaskId::new("my-app", "prepare").into_owned())));
        assert!(deps.contains(&TaskNode::Task(TaskId::new("util", "codegen").into_owned())));
    }

    #[tokio::test]
    async fn test_missing_qualified_dependency_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_package_graph(&tmp).await;
        let root_turbo =
            turbo_json(r#"{"tasks": {"build": {"dependsOn": ["ghost#compile"]}}}"#);
        let workspace_jsons = HashMap::new();

        let result = EngineBuilder::new(&graph, &root_turbo, &workspace_jsons)
            .with_workspaces(vec![PackageName::from("my-app")])
            .with_tasks(Some(TaskName::from("build")))
            .build();
        assert!(matches!(
            result,
            Err(Error::MissingTaskDependency { task_id }) if task_id == "ghost#compile"
        ));
    }

    #[tokio::test]
    async fn test_missing_root_dependency_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_package_graph(&tmp).await;
        let root_turbo =
            turbo_json(r#"{"tasks": {"build": {"dependsOn": ["//#not-defined"]}}}"#);
        let workspace_jsons = HashMap::new();

        let engine = EngineBuilder::new(&graph, &root_turbo, &workspace_jsons)
            .with_workspaces(vec![PackageName::from("my-app")])
            .with_tasks(Some(TaskName::from("build")))
            .build()
            .unwrap();
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_erases_edges() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_package_graph(&tmp).await;
        let root_turbo = turbo_json(r#"{"tasks": {"build": {"dependsOn": ["^build"]}}}"#);
        let workspace_jsons = HashMap::new();

        let engine = EngineBuilder::new(&graph, &root_turbo, &workspace_jsons)
            .with_workspaces(all_packages(&graph))
            .with_tasks(Some(TaskName::from("build")))
            .with_parallel(true)
            .build()
            .unwrap();

        for task_id in engine.task_ids() {
            assert_eq!(
                engine.dependencies(task_id).unwrap(),
                HashSet::from([&TaskNode::Root]),
                "{task_id} should only point at root"
            );
        }
    }

    #[tokio::test]
    async fn test_workspace_override_merges_with_root() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_package_graph(&tmp).await;
        let root_turbo = turbo_json(
            r#"{"tasks": {"build": {"dependsOn": ["^build"], "outputs": ["dist/**"]}}}"#,
        );
        let mut workspace_jsons = HashMap::new();
        workspace_jsons.insert(
            PackageName::from("util"),
            turbo_json(r#"{"extends": ["//"], "tasks": {"build": {"outputs": ["lib/**"]}}}"#),
        );

        let engine = EngineBuilder::new(&graph, &root_turbo, &workspace_jsons)
            .with_workspaces(all_packages(&graph))
            .with_tasks(Some(TaskName::from("build")))
            .build()
            .unwrap();

        let util_def = engine
            .task_definition(&TaskId::new("util", "build"))
            .unwrap();
        assert_eq!(util_def.outputs.inclusions, vec!["lib/**"]);
        // dependsOn is inherited from the root definition
        assert_eq!(
            util_def.topological_dependencies,
            vec![TaskName::from("build")]
        );

        let app_def = engine
            .task_definition(&TaskId::new("my-app", "build"))
            .unwrap();
        assert_eq!(app_def.outputs.inclusions, vec!["dist/**"]);
    }
}
