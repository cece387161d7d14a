//! Per-task fingerprinting.
//!
//! File hashing happens up front, fanned out across packages; task
//! fingerprints are then computed on demand as the scheduler reaches each
//! task, folding in upstream fingerprints. The tracker is the shared
//! record of everything hashing learned, sealed against writes by clock
//! order: fingerprints are inserted before execution starts reading them.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_cache::CacheHitMetadata;
use turborepo_env::{BySource, DetailedMap, EnvironmentVariableMap};
use turborepo_repository::package_graph::{PackageInfo, PackageName, ROOT_PKG_NAME};
use turborepo_scm::SCM;

use crate::{
    cli::EnvMode,
    engine::TaskNode,
    framework::infer_framework,
    hash::{FileHashes, LockFilePackages, TaskHashable, TurboHash},
    opts::RunOpts,
    run::task_id::TaskId,
    turbo_json::TaskDefinition,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing pipeline entry {0}")]
    MissingPipelineEntry(TaskId<'static>),
    #[error("missing package.json for {0}")]
    MissingPackageJson(String),
    #[error("cannot find package-file hash for {0}")]
    MissingPackageFileHash(String),
    #[error("missing hash for dependent task {0}")]
    MissingDependencyTaskHash(String),
    #[error(transparent)]
    Scm(#[from] turborepo_scm::Error),
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

/// The hash of every package's external-dependency closure.
pub fn get_external_deps_hash(
    transitive_dependencies: &Option<HashSet<turborepo_lockfiles::Package>>,
) -> String {
    let Some(transitive_dependencies) = transitive_dependencies else {
        return String::new();
    };
    LockFilePackages(transitive_dependencies.iter().cloned().collect()).hash()
}

#[derive(Debug, Default)]
pub struct PackageInputsHashes {
    hashes: HashMap<TaskId<'static>, String>,
    expanded_hashes: HashMap<TaskId<'static>, FileHashes>,
}

impl PackageInputsHashes {
    /// Hashes the input file set of every (package, task) pair in the
    /// engine, in parallel across tasks.
    pub fn calculate_file_hashes<'a>(
        scm: &SCM,
        all_tasks: impl Iterator<Item = &'a TaskNode>,
        workspaces: &HashMap<&PackageName, &PackageInfo>,
        task_definitions: &HashMap<TaskId<'static>, Arc<TaskDefinition>>,
        repo_root: &AbsoluteSystemPath,
    ) -> Result<PackageInputsHashes, Error> {
        let hash_tasks: Vec<&TaskId<'static>> = all_tasks
            .filter_map(|task| match task {
                TaskNode::Task(task_id) if task_id.package() != ROOT_PKG_NAME => Some(task_id),
                _ => None,
            })
            .collect();

        let hashes = hash_tasks
            .into_par_iter()
            .map(|task_id| {
                let task_definition = task_definitions
                    .get(task_id)
                    .ok_or_else(|| Error::MissingPipelineEntry(task_id.clone()))?;
                let package_name = PackageName::from(task_id.package());
                let workspace = workspaces
                    .get(&package_name)
                    .ok_or_else(|| Error::MissingPackageJson(task_id.package().to_string()))?;

                let package_path = workspace.package_path();
                let mut hash_object = scm.get_package_file_hashes(
                    repo_root,
                    package_path,
                    &task_definition.inputs,
                )?;

                // Declared .env files contribute even when gitignored.
                if !task_definition.dot_env.is_empty() {
                    let package_dir = repo_root.resolve(package_path);
                    let dot_env_object = scm.hash_existing_of(
                        &package_dir,
                        task_definition
                            .dot_env
                            .iter()
                            .map(|p| p.to_anchored_system_path_buf()),
                    )?;
                    hash_object.extend(dot_env_object);
                }

                let file_hashes = FileHashes(hash_object.into_iter().collect());
                Ok((task_id.clone(), file_hashes))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut result = PackageInputsHashes::default();
        for (task_id, file_hashes) in hashes {
            result.hashes.insert(task_id.clone(), file_hashes.hash());
            result.expanded_hashes.insert(task_id, file_hashes);
        }
        Ok(result)
    }
}

#[derive(Debug, Default)]
struct TaskHashTrackerState {
    package_task_hashes: HashMap<TaskId<'static>, String>,
    package_task_env_vars: HashMap<TaskId<'static>, DetailedMap>,
    package_task_outputs: HashMap<TaskId<'static>, Vec<AnchoredSystemPathBuf>>,
    package_task_cache: HashMap<TaskId<'static>, CacheHitMetadata>,
    package_task_framework: HashMap<TaskId<'static>, &'static str>,
}

/// Shared, thread-safe record of per-task hashing and caching outcomes.
#[derive(Debug, Default, Clone)]
pub struct TaskHashTracker {
    state: Arc<Mutex<TaskHashTrackerState>>,
}

impl TaskHashTracker {
    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_hashes.get(task_id).cloned()
    }

    pub fn env_vars(&self, task_id: &TaskId) -> Option<DetailedMap> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_env_vars.get(task_id).cloned()
    }

    pub fn expanded_outputs(&self, task_id: &TaskId) -> Option<Vec<AnchoredSystemPathBuf>> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_outputs.get(task_id).cloned()
    }

    pub fn cache_status(&self, task_id: &TaskId) -> Option<CacheHitMetadata> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_cache.get(task_id).copied()
    }

    pub fn framework(&self, task_id: &TaskId) -> Option<&'static str> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_framework.get(task_id).copied()
    }

    pub fn insert_expanded_outputs(
        &self,
        task_id: TaskId<'static>,
        outputs: Vec<AnchoredSystemPathBuf>,
    ) {
        let mut state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_outputs.insert(task_id, outputs);
    }

    pub fn insert_cache_status(&self, task_id: TaskId<'static>, status: CacheHitMetadata) {
        let mut state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_cache.insert(task_id, status);
    }
}

pub struct TaskHasher<'a> {
    package_inputs_hashes: PackageInputsHashes,
    run_opts: &'a RunOpts,
    env_at_execution_start: &'a EnvironmentVariableMap,
    global_hash: &'a str,
    task_hash_tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        package_inputs_hashes: PackageInputsHashes,
        run_opts: &'a RunOpts,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
    ) -> Self {
        Self {
            package_inputs_hashes,
            run_opts,
            env_at_execution_start,
            global_hash,
            task_hash_tracker: TaskHashTracker::default(),
        }
    }

    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        task_env_mode: EnvMode,
        workspace: &PackageInfo,
        dependency_set: HashSet<&TaskNode>,
    ) -> Result<String, Error> {
        let empty_hash_of_files;
        let hash_of_files = if task_id.package() == ROOT_PKG_NAME {
            // Root tasks have no package directory of their own to hash.
            empty_hash_of_files = FileHashes::default().hash();
            &empty_hash_of_files
        } else {
            self.package_inputs_hashes
                .hashes
                .get(task_id)
                .ok_or_else(|| Error::MissingPackageFileHash(task_id.to_string()))?
        };

        let env_vars = self.resolve_env_vars(task_id, task_definition, workspace)?;
        let hashable_env_pairs = env_vars.all.to_hashable();
        let outputs = task_definition.hashable_outputs(task_id);
        let task_dependency_hashes = self.calculate_dependency_hashes(dependency_set)?;
        let external_deps_hash = get_external_deps_hash(&workspace.transitive_dependencies);

        debug!(
            "task hash env vars for {}: {:?}",
            task_id, hashable_env_pairs
        );

        let task_hashable = TaskHashable {
            global_hash: self.global_hash,
            task_dependency_hashes,
            external_deps_hash,
            hash_of_files,
            task: task_id.task(),
            outputs,
            pass_through_args: &self.run_opts.pass_through_args,
            env: &task_definition.env,
            resolved_env_vars: hashable_env_pairs,
            pass_through_env: task_definition
                .pass_through_env
                .as_deref()
                .unwrap_or_default(),
            env_mode: task_env_mode,
            dot_env: &task_definition.dot_env,
        };
        // Loose mode drops the pass-through declaration from the hash so
        // loose runs stay compatible with undeclared environments.
        let task_hash = if task_env_mode == EnvMode::Loose {
            TaskHashable {
                pass_through_env: &[],
                ..task_hashable
            }
            .hash()
        } else {
            task_hashable.hash()
        };

        let mut state = self
            .task_hash_tracker
            .state
            .lock()
            .expect("hash tracker mutex poisoned");
        state.package_task_hashes.insert(task_id.clone(), task_hash.clone());
        state.package_task_env_vars.insert(task_id.clone(), env_vars);
        drop(state);

        Ok(task_hash)
    }

    fn resolve_env_vars(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        workspace: &PackageInfo,
    ) -> Result<DetailedMap, Error> {
        let mut explicit_env_var_map = EnvironmentVariableMap::default();
        let mut all_env_var_map = EnvironmentVariableMap::default();
        let mut matching_env_var_map = EnvironmentVariableMap::default();

        let framework = self
            .run_opts
            .framework_inference
            .then(|| infer_framework(workspace))
            .flatten();
        if let Some(framework) = framework {
            debug!(
                "auto detected framework {} for {}",
                framework.slug(),
                task_id.package()
            );
            let mut state = self
                .task_hash_tracker
                .state
                .lock()
                .expect("hash tracker mutex poisoned");
            state
                .package_task_framework
                .insert(task_id.clone(), framework.slug());
            drop(state);

            let inference_env_var_map = self
                .env_at_execution_start
                .from_wildcards(framework.env_wildcards())?;

            let user_env_var_set = self
                .env_at_execution_start
                .wildcard_maps_unresolved(&task_definition.env)?;

            // Explicit declarations win; user exclusions beat inference.
            all_env_var_map.union(&user_env_var_set.inclusions);
            all_env_var_map.union(&inference_env_var_map);
            all_env_var_map.difference(&user_env_var_set.exclusions);

            explicit_env_var_map.union(&user_env_var_set.inclusions);
            explicit_env_var_map.difference(&user_env_var_set.exclusions);

            matching_env_var_map.union(&inference_env_var_map);
            matching_env_var_map.difference(&user_env_var_set.exclusions);
        } else {
            all_env_var_map = self
                .env_at_execution_start
                .from_wildcards(&task_definition.env)?;
            explicit_env_var_map.union(&all_env_var_map);
        }

        Ok(DetailedMap {
            all: all_env_var_map,
            by_source: BySource {
                explicit: explicit_env_var_map,
                matching: matching_env_var_map,
            },
        })
    }

    /// The environment the task actually executes with.
    pub fn env(
        &self,
        task_id: &TaskId,
        task_env_mode: EnvMode,
        task_definition: &TaskDefinition,
        global_env: &EnvironmentVariableMap,
    ) -> Result<EnvironmentVariableMap, Error> {
        match task_env_mode {
            EnvMode::Strict => {
                let mut pass_through_env = EnvironmentVariableMap::default();
                let default_env_var_pass_through_map =
                    self.env_at_execution_start.from_wildcards(&[
                        "HOME",
                        "USER",
                        "TZ",
                        "LANG",
                        "SHELL",
                        "PWD",
                        "PATH",
                        "NODE_OPTIONS",
                        "COREPACK_HOME",
                        "LD_LIBRARY_PATH",
                        "SYSTEMROOT",
                        "WINDIR",
                    ])?;
                let tracker_env = self
                    .task_hash_tracker
                    .env_vars(task_id)
                    .expect("hash resolved before execution env");

                pass_through_env.union(&default_env_var_pass_through_map);
                pass_through_env.union(global_env);
                pass_through_env.union(&tracker_env.all);
                if let Some(declared_pass_through) = &task_definition.pass_through_env {
                    let declared =
                        self.env_at_execution_start.from_wildcards(declared_pass_through)?;
                    pass_through_env.union(&declared);
                }
                // Declared-but-unset placeholders don't belong in a child
                // environment.
                pass_through_env.retain(|_, value| !value.is_empty());
                Ok(pass_through_env)
            }
            EnvMode::Loose | EnvMode::Infer => Ok(self.env_at_execution_start.clone()),
        }
    }

    fn calculate_dependency_hashes(
        &self,
        dependency_set: HashSet<&TaskNode>,
    ) -> Result<Vec<String>, Error> {
        let mut dependency_hashes = HashSet::new();
        for dependency_task in dependency_set {
            let TaskNode::Task(dependency_task_id) = dependency_task else {
                continue;
            };
            let state = self
                .task_hash_tracker
                .state
                .lock()
                .expect("hash tracker mutex poisoned");
            let hash = state
                .package_task_hashes
                .get(dependency_task_id)
                .ok_or_else(|| {
                    Error::MissingDependencyTaskHash(dependency_task_id.to_string())
                })?
                .clone();
            dependency_hashes.insert(hash);
        }

        let mut sorted: Vec<_> = dependency_hashes.into_iter().collect();
        sorted.sort();
        Ok(sorted)
    }

    pub fn task_hash_tracker(&self) -> TaskHashTracker {
        self.task_hash_tracker.clone()
    }

    pub fn expanded_file_hashes(&self, task_id: &TaskId<'static>) -> Option<&FileHashes> {
        self.package_inputs_hashes.expanded_hashes.get(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::LogOrder;

    fn run_opts() -> RunOpts {
        RunOpts {
            tasks: vec!["build".to_string()],
            concurrency: 2,
            parallel: false,
            continue_on_error: false,
            only: false,
            dry_run: None,
            env_mode: EnvMode::Infer,
            framework_inference: true,
            pass_through_args: Vec::new(),
            log_order: LogOrder::Auto,
            summarize: false,
        }
    }

    fn workspace() -> PackageInfo {
        PackageInfo {
            package_json: Default::default(),
            package_json_path: turbopath::AnchoredSystemPathBuf::from_raw("package.json")
                .unwrap(),
            unresolved_external_dependencies: None,
            transitive_dependencies: None,
        }
    }

    #[test]
    fn test_task_hash_changes_with_upstream_hash() {
        let env = EnvironmentVariableMap::default();
        let opts = run_opts();

        let dep_id = TaskId::new("util", "build").into_owned();
        let dep_node = TaskNode::Task(dep_id.clone());
        let app_id = TaskId::new("app", "build").into_owned();

        let mut inputs = PackageInputsHashes::default();
        inputs.hashes.insert(app_id.clone(), "filehash".to_string());
        inputs.hashes.insert(dep_id.clone(), "dephash-1".to_string());

        let hasher = TaskHasher::new(inputs, &opts, &env, "globalhash");
        let definition = TaskDefinition::default();

        let dep_hash = hasher
            .calculate_task_hash(&dep_id, &definition, EnvMode::Loose, &workspace(), HashSet::new())
            .unwrap();
        let app_hash_one = hasher
            .calculate_task_hash(
                &app_id,
                &definition,
                EnvMode::Loose,
                &workspace(),
                HashSet::from([&dep_node]),
            )
            .unwrap();
        assert_ne!(dep_hash, app_hash_one);

        // Same task without the dependency produces a different hash.
        let app_hash_two = hasher
            .calculate_task_hash(&app_id, &definition, EnvMode::Loose, &workspace(), HashSet::new())
            .unwrap();
        assert_ne!(app_hash_one, app_hash_two);
    }

    #[test]
    fn test_missing_dependency_hash_is_an_error() {
        let env = EnvironmentVariableMap::default();
        let opts = run_opts();
        let app_id = TaskId::new("app", "build").into_owned();
        let dep_node = TaskNode::Task(TaskId::new("util", "build").into_owned());

        let mut inputs = PackageInputsHashes::default();
        inputs.hashes.insert(app_id.clone(), "filehash".to_string());

        let hasher = TaskHasher::new(inputs, &opts, &env, "globalhash");
        let result = hasher.calculate_task_hash(
            &app_id,
            &TaskDefinition::default(),
            EnvMode::Loose,
            &workspace(),
            HashSet::from([&dep_node]),
        );
        assert!(matches!(result, Err(Error::MissingDependencyTaskHash(_))));
    }
}
