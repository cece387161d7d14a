//! The global fingerprint: one value per run covering every shared input.

use globwalk::{globwalk, WalkType};
use tracing::debug;
use turbopath::AbsoluteSystemPath;
use turborepo_env::{DetailedMap, EnvironmentVariableMap};
use turborepo_lockfiles::Lockfile;
use turborepo_scm::SCM;

use crate::{
    cli::EnvMode,
    hash::{FileHashes, GlobalHashable, TurboHash},
    task_hash,
};

// Bumping this invalidates every cache artifact everywhere.
const GLOBAL_CACHE_KEY: &str = "I can't see ya, but I know you're here";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Scm(#[from] turborepo_scm::Error),
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error(transparent)]
    Walk(#[from] globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

/// Everything that feeds the global fingerprint, kept around for the run
/// summary.
pub struct GlobalHashableInputs<'a> {
    pub global_cache_key: &'static str,
    pub global_file_hash_map: FileHashes,
    pub root_external_deps_hash: Option<String>,
    pub env: &'a [String],
    pub resolved_env_vars: DetailedMap,
    pub pass_through_env: Option<&'a [String]>,
    pub env_mode: EnvMode,
    pub framework_inference: bool,
    pub dot_env_hashes: FileHashes,
}

#[allow(clippy::too_many_arguments)]
pub fn get_global_hash_inputs<'a>(
    repo_root: &AbsoluteSystemPath,
    root_external_dependencies_hash: Option<String>,
    lockfile: Option<&dyn Lockfile>,
    scm: &SCM,
    global_file_dependencies: &'a [String],
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: &'a [String],
    global_pass_through_env: Option<&'a [String]>,
    env_mode: EnvMode,
    framework_inference: bool,
    global_dot_env: Option<&'a [turbopath::RelativeUnixPathBuf]>,
) -> Result<GlobalHashableInputs<'a>, Error> {
    // Root-level files named by globalDependencies, plus any lockfile
    // patches: changing either invalidates everything.
    let mut global_files = Vec::new();
    if !global_file_dependencies.is_empty() {
        let (inclusions, exclusions): (Vec<_>, Vec<_>) = global_file_dependencies
            .iter()
            .cloned()
            .partition(|glob| !glob.starts_with('!'));
        let exclusions: Vec<_> = exclusions
            .into_iter()
            .map(|glob| glob[1..].to_string())
            .collect();
        for file in globwalk(repo_root, &inclusions, &exclusions, WalkType::Files)? {
            global_files.push(repo_root.anchor(&file)?);
        }
    }
    if let Some(lockfile) = lockfile {
        if let Ok(patches) = lockfile.patches() {
            for patch in patches {
                global_files.push(patch.to_anchored_system_path_buf());
            }
        }
    }

    let global_file_hash_map = FileHashes(
        scm.hash_existing_of(repo_root, global_files)?
            .into_iter()
            .collect(),
    );

    let resolved_env_vars = turborepo_env::DetailedMap {
        all: env_at_execution_start.from_wildcards(global_env)?,
        by_source: turborepo_env::BySource {
            explicit: env_at_execution_start.from_wildcards(global_env)?,
            matching: EnvironmentVariableMap::default(),
        },
    };

    let dot_env_hashes = FileHashes(
        scm.hash_existing_of(
            repo_root,
            global_dot_env
                .unwrap_or_default()
                .iter()
                .map(|path| path.to_anchored_system_path_buf()),
        )?
        .into_iter()
        .collect(),
    );

    Ok(GlobalHashableInputs {
        global_cache_key: GLOBAL_CACHE_KEY,
        global_file_hash_map,
        root_external_deps_hash: root_external_dependencies_hash,
        env: global_env,
        resolved_env_vars,
        pass_through_env: global_pass_through_env,
        env_mode,
        framework_inference,
        dot_env_hashes,
    })
}

impl<'a> GlobalHashableInputs<'a> {
    pub fn calculate_global_hash(&self) -> String {
        // In infer mode a pass-through declaration upgrades the whole run
        // to strict before anything is hashed.
        let env_mode = match self.env_mode {
            EnvMode::Infer if self.pass_through_env.is_some() => EnvMode::Strict,
            other => other,
        };

        let hashable = GlobalHashable {
            global_cache_key: self.global_cache_key,
            global_file_hash_map: &self.global_file_hash_map,
            root_external_deps_hash: self.root_external_deps_hash.as_deref(),
            env: self.resolved_env_vars.all.to_secret_hashable(),
            pass_through_env: self.pass_through_env.unwrap_or_default(),
            env_mode,
            framework_inference: self.framework_inference,
            dot_env_hashes: &self.dot_env_hashes,
        };
        let hash = hashable.hash();
        debug!("global hash: {hash}");
        hash
    }
}

/// The external-deps hash for the root package, pulled from the package
/// graph's transitive closures.
pub fn root_external_dependencies_hash(
    pkg_dep_graph: &turborepo_repository::package_graph::PackageGraph,
) -> Option<String> {
    use turborepo_repository::package_graph::PackageName;
    let root_info = pkg_dep_graph.package_info(&PackageName::Root)?;
    root_info
        .transitive_dependencies
        .as_ref()
        .map(|_| task_hash::get_external_deps_hash(&root_info.transitive_dependencies))
}

#[cfg(test)]
mod tests {
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    fn inputs_for(
        repo_root: &AbsoluteSystemPath,
        env: &EnvironmentVariableMap,
        global_deps: &'static [String],
        global_env: &'static [String],
    ) -> String {
        let scm = SCM::Manual;
        get_global_hash_inputs(
            repo_root,
            None,
            None,
            &scm,
            global_deps,
            env,
            global_env,
            None,
            EnvMode::Infer,
            true,
            None,
        )
        .unwrap()
        .calculate_global_hash()
    }

    #[test]
    fn test_global_hash_sensitivity() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_root =
            AbsoluteSystemPathBuf::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        let tsconfig = repo_root.join_component("tsconfig.json");
        tsconfig.create_with_contents("{}").unwrap();

        let deps: &'static [String] = Box::leak(Box::new(["tsconfig.json".to_string()]));
        let env_decl: &'static [String] = Box::leak(Box::new(["NODE_ENV".to_string()]));

        let empty_env = EnvironmentVariableMap::default();
        let baseline = inputs_for(&repo_root, &empty_env, deps, env_decl);
        let same = inputs_for(&repo_root, &empty_env, deps, env_decl);
        assert_eq!(baseline, same);

        // Changing a declared global file changes the hash.
        tsconfig.create_with_contents("{\"strict\": true}").unwrap();
        let file_changed = inputs_for(&repo_root, &empty_env, deps, env_decl);
        assert_ne!(baseline, file_changed);

        // Changing a declared env var changes the hash.
        let prod_env: EnvironmentVariableMap =
            [("NODE_ENV".to_string(), "production".to_string())]
                .into_iter()
                .collect();
        let env_changed = inputs_for(&repo_root, &prod_env, deps, env_decl);
        assert_ne!(file_changed, env_changed);
    }

    #[test]
    fn test_infer_upgrades_to_strict_with_pass_through() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_root =
            AbsoluteSystemPathBuf::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        let env = EnvironmentVariableMap::default();
        let scm = SCM::Manual;

        let without = get_global_hash_inputs(
            &repo_root,
            None,
            None,
            &scm,
            &[],
            &env,
            &[],
            None,
            EnvMode::Infer,
            true,
            None,
        )
        .unwrap()
        .calculate_global_hash();

        let pass_through = vec![];
        let with = get_global_hash_inputs(
            &repo_root,
            None,
            None,
            &scm,
            &[],
            &env,
            &[],
            Some(&pass_through),
            EnvMode::Infer,
            true,
            None,
        )
        .unwrap()
        .calculate_global_hash();

        assert_ne!(without, with);
    }
}
