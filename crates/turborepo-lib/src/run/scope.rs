//! Package filtering: `--filter` selectors and `--affected`.

use std::collections::HashSet;

use tracing::warn;
use turbopath::AbsoluteSystemPath;
use turborepo_repository::{
    change_mapper::{ChangeMapper, LockfileChange, PackageChanges},
    package_graph::{PackageGraph, PackageName, PackageNode},
};
use turborepo_scm::SCM;

use crate::opts::ScopeOpts;

const DEFAULT_SCM_BASE: &str = "main";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no package found matching filter '{0}'")]
    NoPackagesMatched(String),
    #[error(transparent)]
    ChangeMapper(#[from] turborepo_repository::change_mapper::Error),
}

/// Resolves the set of packages a run operates on. The root package is
/// never included implicitly; root tasks opt in via `//#task` targets.
pub fn resolve_packages(
    opts: &ScopeOpts,
    repo_root: &AbsoluteSystemPath,
    pkg_graph: &PackageGraph,
    scm: &SCM,
    global_deps: &[String],
) -> Result<HashSet<PackageName>, Error> {
    let all_packages: HashSet<PackageName> = pkg_graph
        .packages()
        .map(|(name, _)| name.clone())
        .filter(|name| !matches!(name, PackageName::Root))
        .collect();

    let mut selected = if opts.filter_patterns.is_empty() {
        all_packages.clone()
    } else {
        let mut selected = HashSet::new();
        for pattern in &opts.filter_patterns {
            let matched = apply_filter(pattern, pkg_graph, &all_packages);
            if matched.is_empty() {
                return Err(Error::NoPackagesMatched(pattern.clone()));
            }
            selected.extend(matched);
        }
        selected
    };

    if opts.affected {
        let affected = affected_packages(opts, repo_root, pkg_graph, scm, global_deps)?;
        selected.retain(|name| affected.contains(name));
    }

    Ok(selected)
}

/// One `--filter` selector: a package name or glob, with `...` suffix
/// pulling in dependencies and `...` prefix pulling in dependents.
fn apply_filter(
    pattern: &str,
    pkg_graph: &PackageGraph,
    all_packages: &HashSet<PackageName>,
) -> HashSet<PackageName> {
    let (include_dependents, rest) = match pattern.strip_prefix("...") {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let (include_dependencies, name_glob) = match rest.strip_suffix("...") {
        Some(rest) => (true, rest),
        None => (false, rest),
    };

    let mut matched = HashSet::new();
    for package in all_packages {
        if glob_match::glob_match(name_glob, package.as_str()) {
            matched.insert(package.clone());
        }
    }

    let mut result = matched.clone();
    for package in matched {
        let node = PackageNode::Workspace(package);
        if include_dependencies {
            result.extend(
                pkg_graph
                    .dependencies(&node)
                    .into_iter()
                    .map(|dep| dep.as_package_name().clone())
                    .filter(|name| !matches!(name, PackageName::Root)),
            );
        }
        if include_dependents {
            result.extend(
                pkg_graph
                    .ancestors(&node)
                    .into_iter()
                    .map(|dep| dep.as_package_name().clone())
                    .filter(|name| !matches!(name, PackageName::Root)),
            );
        }
    }
    result
}

/// Packages changed between the SCM base and head. A range that cannot be
/// resolved (shallow clone, missing ref) downgrades to all packages with
/// exactly one warning.
fn affected_packages(
    opts: &ScopeOpts,
    repo_root: &AbsoluteSystemPath,
    pkg_graph: &PackageGraph,
    scm: &SCM,
    global_deps: &[String],
) -> Result<HashSet<PackageName>, Error> {
    let base = opts.scm_base.as_deref().unwrap_or(DEFAULT_SCM_BASE);
    let head = opts.scm_head.as_deref();

    let changed_files = match scm.changed_files(repo_root, base, head) {
        Ok(files) => files,
        Err(e) if e.is_recoverable() => {
            warn!("unable to detect git range, assuming all files have changed: {e}");
            return Ok(pkg_graph
                .packages()
                .map(|(name, _)| name.clone())
                .filter(|name| !matches!(name, PackageName::Root))
                .collect());
        }
        Err(e) => {
            warn!("failed to query source control, assuming all files have changed: {e}");
            return Ok(pkg_graph
                .packages()
                .map(|(name, _)| name.clone())
                .filter(|name| !matches!(name, PackageName::Root))
                .collect());
        }
    };

    let lockfile_path = pkg_graph
        .package_manager()
        .lockfile_path(repo_root);
    let lockfile_change = ChangeMapper::lockfile_changed(repo_root, &changed_files, &lockfile_path)
        .then(|| {
            scm.previous_content(base, &lockfile_path)
                .map(LockfileChange::WithContent)
                .unwrap_or(LockfileChange::Empty)
        });

    let mapper = ChangeMapper::new(pkg_graph, global_deps.to_vec());
    match mapper.changed_packages(changed_files, lockfile_change)? {
        PackageChanges::All => Ok(pkg_graph
            .packages()
            .map(|(name, _)| name.clone())
            .filter(|name| !matches!(name, PackageName::Root))
            .collect()),
        PackageChanges::Some(mut changed) => {
            changed.remove(&PackageName::Root);
            // A change in a package invalidates everything that depends on
            // it.
            let mut result = changed.clone();
            for package in changed {
                let node = PackageNode::Workspace(package);
                result.extend(
                    pkg_graph
                        .ancestors(&node)
                        .into_iter()
                        .map(|dep| dep.as_package_name().clone())
                        .filter(|name| !matches!(name, PackageName::Root)),
                );
            }
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use turborepo_repository::{package_graph::PackageGraph, package_json::PackageJson};

    use super::*;

    async fn test_graph(tmp: &tempfile::TempDir) -> PackageGraph {
        let root = turbopath::AbsoluteSystemPathBuf::from_std_path(
            &tmp.path().canonicalize().unwrap(),
        )
        .unwrap();
        let write = |dir: &str, contents: &str| {
            let manifest = root
                .join_unix_path(turbopath::RelativeUnixPath::new(dir).unwrap())
                .join_component("package.json");
            manifest.ensure_dir().unwrap();
            manifest.create_with_contents(contents).unwrap();
        };
        root.join_component("package.json")
            .create_with_contents(r#"{"name": "monorepo", "workspaces": ["packages/*"]}"#)
            .unwrap();
        write(
            "packages/web",
            r#"{"name": "web", "version": "1.0.0", "dependencies": {"util": "*"}}"#,
        );
        write("packages/util", r#"{"name": "util", "version": "1.0.0"}"#);
        write("packages/docs", r#"{"name": "docs", "version": "1.0.0"}"#);

        let root_manifest = PackageJson::load(&root.join_component("package.json")).unwrap();
        PackageGraph::builder(&root, root_manifest)
            .build()
            .await
            .unwrap()
    }

    fn names(set: HashSet<PackageName>) -> Vec<String> {
        let mut names: Vec<_> = set.into_iter().map(|name| name.to_string()).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_no_filters_selects_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_graph(&tmp).await;
        let root = turbopath::AbsoluteSystemPathBuf::from_std_path(
            &tmp.path().canonicalize().unwrap(),
        )
        .unwrap();

        let selected = resolve_packages(
            &ScopeOpts::default(),
            &root,
            &graph,
            &SCM::Manual,
            &[],
        )
        .unwrap();
        assert_eq!(names(selected), vec!["docs", "util", "web"]);
    }

    #[tokio::test]
    async fn test_filter_with_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_graph(&tmp).await;
        let root = turbopath::AbsoluteSystemPathBuf::from_std_path(
            &tmp.path().canonicalize().unwrap(),
        )
        .unwrap();

        let opts = ScopeOpts {
            filter_patterns: vec!["web...".to_string()],
            ..Default::default()
        };
        let selected = resolve_packages(&opts, &root, &graph, &SCM::Manual, &[]).unwrap();
        assert_eq!(names(selected), vec!["util", "web"]);
    }

    #[tokio::test]
    async fn test_filter_with_dependents() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_graph(&tmp).await;
        let root = turbopath::AbsoluteSystemPathBuf::from_std_path(
            &tmp.path().canonicalize().unwrap(),
        )
        .unwrap();

        let opts = ScopeOpts {
            filter_patterns: vec!["...util".to_string()],
            ..Default::default()
        };
        let selected = resolve_packages(&opts, &root, &graph, &SCM::Manual, &[]).unwrap();
        assert_eq!(names(selected), vec!["util", "web"]);
    }

    #[tokio::test]
    async fn test_unmatched_filter_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_graph(&tmp).await;
        let root = turbopath::AbsoluteSystemPathBuf::from_std_path(
            &tmp.path().canonicalize().unwrap(),
        )
        .unwrap();

        let opts = ScopeOpts {
            filter_patterns: vec!["ghost".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            resolve_packages(&opts, &root, &graph, &SCM::Manual, &[]),
            Err(Error::NoPackagesMatched(_))
        ));
    }

    #[tokio::test]
    async fn test_affected_without_git_selects_everything_with_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let graph = test_graph(&tmp).await;
        let root = turbopath::AbsoluteSystemPathBuf::from_std_path(
            &tmp.path().canonicalize().unwrap(),
        )
        .unwrap();

        let opts = ScopeOpts {
            affected: true,
            ..Default::default()
        };
        let selected = resolve_packages(&opts, &root, &graph, &SCM::Manual, &[]).unwrap();
        assert_eq!(names(selected), vec!["docs", "util", "web"]);
    }
}
