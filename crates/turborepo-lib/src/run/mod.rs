//! One invocation, front to back: build the graphs, compute the hashes,
//! schedule, execute against the cache, summarize.

pub mod cache;
pub mod global_hash;
pub mod scope;
pub mod summary;
pub mod task_id;

use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Local;
use tracing::debug;
use turbopath::AbsoluteSystemPath;
use turborepo_cache::AsyncCache;
use turborepo_env::EnvironmentVariableMap;
use turborepo_repository::{
    package_graph::{PackageGraph, PackageName},
    package_json::PackageJson,
};
use turborepo_scm::SCM;

use crate::{
    cli::{EnvMode, RunArgs},
    config::ConfigurationOptions,
    engine::{self, Engine, EngineBuilder},
    opts::Opts,
    run::{
        cache::RunCache,
        global_hash::{get_global_hash_inputs, root_external_dependencies_hash},
        summary::{GlobalHashSummary, RunTracker},
        task_id::TaskName,
    },
    task_graph::Visitor,
    task_hash::PackageInputsHashes,
    turbo_json::{TurboJson, TurboJsonLoader, CONFIG_FILE},
};

pub const TURBO_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] crate::config::Error),
    #[error(transparent)]
    PackageJson(#[from] turborepo_repository::package_json::Error),
    #[error(transparent)]
    PackageGraph(#[from] turborepo_repository::package_graph::Error),
    #[error(transparent)]
    EngineBuilder(#[from] engine::BuilderError),
    #[error("invalid task configuration:\n{0}")]
    EngineValidation(String),
    #[error(transparent)]
    Scope(#[from] scope::Error),
    #[error(transparent)]
    GlobalHash(#[from] global_hash::Error),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    Visitor(#[from] crate::task_graph::Error),
    #[error(transparent)]
    Cache(#[from] turborepo_cache::CacheError),
    #[error(transparent)]
    Summary(#[from] summary::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

impl Error {
    /// Configuration and graph problems are the caller's fault: exit 2.
    /// Everything else is a failed run: exit 1.
    pub fn is_invalid_invocation(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::PackageJson(_)
                | Error::PackageGraph(_)
                | Error::EngineBuilder(_)
                | Error::EngineValidation(_)
                | Error::Scope(_)
        )
    }
}

pub struct Run {
    repo_root: turbopath::AbsoluteSystemPathBuf,
    processes: crate::process::ProcessManager,
}

impl Run {
    pub fn new(
        repo_root: &AbsoluteSystemPath,
        processes: crate::process::ProcessManager,
    ) -> Self {
        Self {
            repo_root: repo_root.to_owned(),
            processes,
        }
    }

    pub async fn run(&self, args: &RunArgs) -> Result<i32, Error> {
        let started_at = Local::now();
        let start_instant = Instant::now();
        let repo_root = self.repo_root.as_absolute_path();
        let env_at_execution_start = EnvironmentVariableMap::infer();

        let root_package_json = PackageJson::load(&repo_root.join_component("package.json"))?;

        let pkg_dep_graph = PackageGraph::builder(repo_root, root_package_json.clone())
            .build()
            .await?;
        pkg_dep_graph.validate()?;

        // The root turbo.json location honors TURBO_ROOT_TURBO_JSON before
        // full config layering, because the config file is itself a layer.
        let root_turbo_json_path = env_at_execution_start
            .get("TURBO_ROOT_TURBO_JSON")
            .filter(|v| !v.is_empty())
            .map(|path| turbopath::AbsoluteSystemPathBuf::from_unknown(repo_root, path.clone()))
            .unwrap_or_else(|| repo_root.join_component(CONFIG_FILE));
        let loader = TurboJsonLoader::workspace(
            repo_root.to_owned(),
            root_turbo_json_path,
            pkg_dep_graph.packages(),
        );
        let root_turbo_json = loader.load(&PackageName::Root)?;
        let workspace_turbo_jsons = loader.load_workspace_configs()?;

        let config = ConfigurationOptions::build(
            root_turbo_json.remote_cache.as_ref(),
            &env_at_execution_start,
            args,
        )?;
        let opts = Opts::new(args, &config)?;

        let scm = SCM::new(repo_root);

        let mut filtered_pkgs = scope::resolve_packages(
            &opts.scope_opts,
            repo_root,
            &pkg_dep_graph,
            &scm,
            &root_turbo_json.global_deps,
        )?;
        // A target that the root pipeline defines as `//#task` pulls the
        // root package into scope.
        for target in &opts.run_opts.tasks {
            let task_name = TaskName::from(target.as_str());
            let root_task = if task_name.is_package_task() {
                task_name.clone()
            } else {
                task_name.clone().into_root_task()
            };
            if root_turbo_json.tasks.contains_key(&root_task) {
                filtered_pkgs.insert(PackageName::Root);
                break;
            }
        }

        let engine = self.build_engine(
            &pkg_dep_graph,
            &root_turbo_json,
            &workspace_turbo_jsons,
            &opts,
            &filtered_pkgs,
        )?;

        let root_external_deps_hash = root_external_dependencies_hash(&pkg_dep_graph);
        let global_hash_inputs = get_global_hash_inputs(
            repo_root,
            root_external_deps_hash,
            pkg_dep_graph.lockfile(),
            &scm,
            &root_turbo_json.global_deps,
            &env_at_execution_start,
            &root_turbo_json.global_env,
            root_turbo_json.global_pass_through_env.as_deref(),
            opts.run_opts.env_mode,
            opts.run_opts.framework_inference,
            root_turbo_json.global_dot_env.as_deref(),
        )?;
        let global_hash = global_hash_inputs.calculate_global_hash();

        let mut global_env_mode = opts.run_opts.env_mode;
        if matches!(global_env_mode, EnvMode::Infer)
            && root_turbo_json.global_pass_through_env.is_some()
        {
            global_env_mode = EnvMode::Strict;
        }

        let async_cache = AsyncCache::new(&opts.cache_opts, repo_root, None)?;
        let run_cache = Arc::new(RunCache::new(async_cache, repo_root, &opts.runcache_opts));

        let workspaces: HashMap<_, _> = pkg_dep_graph.packages().collect();
        let package_inputs_hashes = PackageInputsHashes::calculate_file_hashes(
            &scm,
            engine.tasks(),
            &workspaces,
            engine.task_definitions(),
            repo_root,
        )?;
        drop(workspaces);

        let global_env = {
            let mut env = env_at_execution_start.from_wildcards(
                global_hash_inputs.pass_through_env.unwrap_or_default(),
            )
            .map_err(crate::task_hash::Error::Env)?;
            env.union(&global_hash_inputs.resolved_env_vars.all);
            env
        };

        let run_tracker = RunTracker::new(
            started_at,
            format!("turbo run {}", opts.run_opts.tasks.join(" ")),
            TURBO_VERSION,
        );

        let pkg_dep_graph = Arc::new(pkg_dep_graph);
        let engine = Arc::new(engine);

        let mut visitor = Visitor::new(
            repo_root,
            pkg_dep_graph.clone(),
            run_cache.clone(),
            run_tracker.clone(),
            &opts.run_opts,
            package_inputs_hashes,
            &env_at_execution_start,
            &global_hash,
            global_env_mode,
            self.processes.clone(),
            global_env,
        );
        if opts.run_opts.dry_run.is_some() {
            visitor.dry_run();
        }

        debug!("running visitor");
        let errors = visitor.visit(engine.clone()).await?;
        // The tracker must have no other holders before the summary is
        // assembled.
        drop(visitor);

        let exit_code = errors
            .iter()
            .filter_map(|err| err.exit_code())
            .max()
            .unwrap_or(if errors.is_empty() { 0 } else { 1 });
        for err in &errors {
            eprintln!("{err}");
        }

        // All cache writes settle before the summary reports.
        run_cache.shutdown_cache().await;

        let global_cache_inputs = GlobalHashSummary {
            global_cache_key: global_hash_inputs.global_cache_key,
            files: global_hash_inputs
                .global_file_hash_map
                .0
                .iter()
                .map(|(path, hash)| (path.as_str().to_string(), hash.clone()))
                .collect(),
            hash_of_external_dependencies: global_hash_inputs
                .root_external_deps_hash
                .clone()
                .unwrap_or_default(),
            global_env_vars: global_hash_inputs.env.to_vec(),
            global_pass_through_env: global_hash_inputs
                .pass_through_env
                .map(|env| env.to_vec()),
            global_dot_env_hashes: global_hash_inputs
                .dot_env_hashes
                .0
                .iter()
                .map(|(path, hash)| (path.as_str().to_string(), hash.clone()))
                .collect(),
        };
        let summary = run_tracker.into_summary(
            exit_code,
            global_hash,
            global_cache_inputs,
            global_env_mode,
            !scm.is_manual(),
        );

        if let Some(dry_run_mode) = opts.run_opts.dry_run {
            summary.print_dry_run(dry_run_mode)?;
            return Ok(0);
        }
        summary.print_text(start_instant.elapsed());
        summary.maybe_save(opts.run_opts.summarize, repo_root);

        Ok(exit_code)
    }

    fn build_engine(
        &self,
        pkg_dep_graph: &PackageGraph,
        root_turbo_json: &TurboJson,
        workspace_turbo_jsons: &HashMap<PackageName, TurboJson>,
        opts: &Opts,
        filtered_pkgs: &std::collections::HashSet<PackageName>,
    ) -> Result<Engine, Error> {
        let engine = EngineBuilder::new(pkg_dep_graph, root_turbo_json, workspace_turbo_jsons)
            .with_workspaces(filtered_pkgs.iter().cloned())
            .with_tasks(
                opts.run_opts
                    .tasks
                    .iter()
                    .map(|task| TaskName::from(task.clone())),
            )
            .with_tasks_only(opts.run_opts.only)
            .with_parallel(opts.run_opts.parallel)
            .build()?;

        engine
            .validate(opts.run_opts.concurrency)
            .map_err(|errors| {
                Error::EngineValidation(engine::format_validation_errors(&errors))
            })?;

        Ok(engine)
    }
}
