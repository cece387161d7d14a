//! Loading of turbo.json files across the workspace.

use std::collections::HashMap;

use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_repository::package_graph::{PackageInfo, PackageName};

use super::{RawTurboJson, TurboJson, CONFIG_FILE};
use crate::config::Error;

/// Loads and validates turbo.json files: the root one (required) and
/// per-package overrides (optional, must extend `//`).
#[derive(Debug, Clone)]
pub struct TurboJsonLoader {
    repo_root: AbsoluteSystemPathBuf,
    root_turbo_json_path: AbsoluteSystemPathBuf,
    packages: HashMap<PackageName, AbsoluteSystemPathBuf>,
}

impl TurboJsonLoader {
    pub fn workspace<'a>(
        repo_root: AbsoluteSystemPathBuf,
        root_turbo_json_path: AbsoluteSystemPathBuf,
        packages: impl Iterator<Item = (&'a PackageName, &'a PackageInfo)>,
    ) -> Self {
        let packages = packages
            .filter(|(name, _)| !matches!(name, PackageName::Root))
            .map(|(name, info)| {
                (
                    name.clone(),
                    repo_root
                        .resolve(info.package_path())
                        .join_component(CONFIG_FILE),
                )
            })
            .collect();
        Self {
            repo_root,
            root_turbo_json_path,
            packages,
        }
    }

    pub fn load(&self, package: &PackageName) -> Result<TurboJson, Error> {
        match package {
            PackageName::Root => {
                let turbo_json = read_turbo_json(&self.root_turbo_json_path)?
                    .ok_or(Error::NoTurboJson)?;
                if !turbo_json.extends.is_empty() {
                    return Err(Error::RootTurboJsonExtends);
                }
                Ok(turbo_json)
            }
            PackageName::Other(_) => {
                let Some(path) = self.packages.get(package) else {
                    return Err(Error::NoTurboJson);
                };
                let turbo_json = read_turbo_json(path)?.ok_or(Error::NoTurboJson)?;
                // Workspace configs may only extend the root config.
                if turbo_json.extends != ["//"] {
                    return Err(Error::InvalidWorkspaceExtends {
                        package: package.to_string(),
                    });
                }
                Ok(turbo_json)
            }
        }
    }

    /// Loads every package-level turbo.json that exists, keyed by package.
    pub fn load_workspace_configs(
        &self,
    ) -> Result<HashMap<PackageName, TurboJson>, Error> {
        let mut configs = HashMap::new();
        for (package, path) in &self.packages {
            if !path.exists() {
                continue;
            }
            debug!("loading workspace config for {package} from {path}");
            let turbo_json = self.load(package)?;
            configs.insert(package.clone(), turbo_json);
        }
        Ok(configs)
    }

    pub fn repo_root(&self) -> &AbsoluteSystemPath {
        &self.repo_root
    }
}

fn read_turbo_json(path: &AbsoluteSystemPath) -> Result<Option<TurboJson>, Error> {
    let contents = match path.read_to_string() {
        Ok(contents) => contents,
        Err(e) if e.is_io_error(std::io::ErrorKind::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let raw: RawTurboJson = serde_json::from_str(&contents).map_err(|error| Error::TurboJsonParse {
        path: path.to_string(),
        error,
    })?;
    TurboJson::try_from(raw).map(Some)
}

#[cfg(test)]
mod tests {
    use turborepo_repository::package_json::PackageJson;

    use super::*;
    use crate::run::task_id::TaskName;

    fn loader_for(
        repo_root: &AbsoluteSystemPath,
        packages: Vec<(PackageName, &str)>,
    ) -> TurboJsonLoader {
        let infos: Vec<(PackageName, PackageInfo)> = packages
            .into_iter()
            .map(|(name, dir)| {
                let package_json_path = turbopath::RelativeUnixPathBuf::new(format!(
                    "{dir}/package.json"
                ))
                .unwrap()
                .to_anchored_system_path_buf();
                (
                    name,
                    PackageInfo {
                        package_json: PackageJson::default(),
                        package_json_path,
                        unresolved_external_dependencies: None,
                        transitive_dependencies: None,
                    },
                )
            })
            .collect();
        TurboJsonLoader::workspace(
            repo_root.to_owned(),
            repo_root.join_component(CONFIG_FILE),
            infos.iter().map(|(name, info)| (name, info)),
        )
    }

    #[test]
    fn test_missing_root_turbo_json_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPath::from_std_path(tmp.path()).unwrap();
        let loader = loader_for(repo_root, vec![]);
        assert!(matches!(
            loader.load(&PackageName::Root),
            Err(Error::NoTurboJson)
        ));
    }

    #[test]
    fn test_workspace_override_requires_extends() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPath::from_std_path(tmp.path()).unwrap();
        let pkg_turbo = repo_root.join_components(&["packages", "ui", CONFIG_FILE]);
        pkg_turbo.ensure_dir().unwrap();
        pkg_turbo
            .create_with_contents(r#"{"tasks": {"build": {}}}"#)
            .unwrap();

        let loader = loader_for(repo_root, vec![(PackageName::from("ui"), "packages/ui")]);
        assert!(matches!(
            loader.load(&PackageName::from("ui")),
            Err(Error::InvalidWorkspaceExtends { .. })
        ));

        pkg_turbo
            .create_with_contents(r#"{"extends": ["//"], "tasks": {"build": {}}}"#)
            .unwrap();
        let turbo_json = loader.load(&PackageName::from("ui")).unwrap();
        assert!(turbo_json.has_task(&TaskName::from("build")));
    }

    #[test]
    fn test_load_workspace_configs_skips_absent_files() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPath::from_std_path(tmp.path()).unwrap();
        let loader = loader_for(
            repo_root,
            vec![
                (PackageName::from("ui"), "packages/ui"),
                (PackageName::from("util"), "packages/util"),
            ],
        );
        assert!(loader.load_workspace_configs().unwrap().is_empty());
    }
}
