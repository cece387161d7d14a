//! The npm dialect: `package-lock.json`, lockfileVersion 2 and 3.
//!
//! Entry keys are `node_modules` paths, so dependency resolution has to
//! mirror npm's hoisting: a dependency of `key` lives at the deepest
//! `<ancestor>/node_modules/<dep>` that exists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Error, Lockfile, Package};

// BTreeMap keeps re-encoding deterministic.
type Map<K, V> = std::collections::BTreeMap<K, V>;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NpmLockfile {
    #[serde(rename = "lockfileVersion")]
    lockfile_version: i32,
    packages: Map<String, NpmPackage>,
    // Parsed so it doesn't land in `other` and get reserialized; the legacy
    // v1 section is never consulted.
    #[serde(skip_serializing, default)]
    dependencies: Map<String, Value>,
    // Unknown fields are carried as raw values so encode() round-trips
    // without describing the full schema.
    #[serde(flatten)]
    other: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NpmPackage {
    version: Option<String>,
    resolved: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    dependencies: Map<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    dev_dependencies: Map<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    peer_dependencies: Map<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    optional_dependencies: Map<String, String>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

impl NpmLockfile {
    pub fn load(content: &[u8]) -> Result<Self, Error> {
        let lockfile: NpmLockfile = serde_json::from_slice(content)?;

        // Lockfiles without 'packages' (v1) required walking node_modules to
        // resolve anything, which we do not do.
        if lockfile.lockfile_version <= 1
            || (lockfile.packages.is_empty() && !lockfile.dependencies.is_empty())
        {
            return Err(Error::UnsupportedNpmVersion);
        }
        Ok(lockfile)
    }

    fn entry(&self, key: &str) -> Result<&NpmPackage, Error> {
        self.packages
            .get(key)
            .ok_or_else(|| Error::MissingPackage(key.to_string()))
    }

    /// Candidate keys for `dep` as seen from `key`, deepest first: every
    /// enclosing node_modules scope up to the root.
    fn hoisting_candidates(key: &str, dep: &str) -> Vec<String> {
        let mut candidates = vec![format!("{key}/node_modules/{dep}")];
        let mut scope = Some(key);
        while let Some(current) = scope {
            let parent = Self::enclosing_scope(current);
            candidates.push(format!("{}node_modules/{dep}", parent.unwrap_or("")));
            scope = parent;
        }
        candidates
    }

    /// The enclosing node_modules scope of a key, including its trailing
    /// slash; `None` once we reach the root.
    fn enclosing_scope(key: &str) -> Option<&str> {
        key.rsplit_once("node_modules/")
            .map(|(prefix, _)| prefix)
            .filter(|prefix| !prefix.is_empty())
    }
}

impl Lockfile for NpmLockfile {
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        _version: &str,
    ) -> Result<Option<Package>, Error> {
        if !self.packages.contains_key(workspace_path) {
            return Err(Error::MissingWorkspace(workspace_path.to_string()));
        }

        // The name may already be a fully-qualified key (when called from
        // all_dependencies output), a workspace-nested install, or a hoisted
        // root install. First hit wins.
        let candidates = [
            name.to_string(),
            format!("{workspace_path}/node_modules/{name}"),
            format!("node_modules/{name}"),
        ];
        Ok(candidates.into_iter().find_map(|key| {
            self.packages.get(&key).map(|pkg| Package {
                version: pkg.version.clone().unwrap_or_default(),
                key,
            })
        }))
    }

    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error> {
        let Some(entry) = self.packages.get(key) else {
            return Ok(None);
        };

        let mut dependencies = HashMap::new();
        for name in entry.dependency_names() {
            let resolved = Self::hoisting_candidates(key, name)
                .into_iter()
                .find_map(|candidate| {
                    let dep_entry = self.packages.get(&candidate)?;
                    match dep_entry.version.as_deref() {
                        Some(version) => Some(Ok((candidate, version.to_string()))),
                        // Workspace link entries carry no version; resolution
                        // continues through the link target's own key.
                        None if dep_entry.resolved.is_some() => None,
                        None => Some(Err(Error::MissingVersion(candidate.clone()))),
                    }
                });
            if let Some(resolved) = resolved {
                let (dep_key, version) = resolved?;
                dependencies.insert(dep_key, version);
            }
        }
        Ok(Some(dependencies))
    }

    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error> {
        let mut pruned = Map::new();
        for key in packages {
            pruned.insert(key.clone(), self.entry(key)?.clone());
        }
        // The root entry ("") describes the repo itself and is always kept.
        if let Some(root) = self.packages.get("") {
            pruned.insert(String::new(), root.clone());
        }
        for workspace in workspace_packages {
            pruned.insert(workspace.clone(), self.entry(workspace)?.clone());

            // Keep the link entry pointing back at the workspace, if any.
            if let Some((key, link)) = self
                .packages
                .iter()
                .find(|(_, entry)| entry.resolved.as_deref() == Some(workspace))
            {
                pruned.insert(key.clone(), link.clone());
            }
        }

        Ok(Box::new(Self {
            lockfile_version: self.lockfile_version,
            packages: pruned,
            dependencies: Map::default(),
            other: self.other.clone(),
        }))
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(&self)?)
    }

    fn global_change_key(&self) -> Vec<u8> {
        let mut key = vec![b'n', b'p', b'm', 0];
        serde_json::to_writer(
            &mut key,
            &json!({
                "version": self.lockfile_version,
                "requires": self.other.get("requires"),
            }),
        )
        .expect("writing to a Vec cannot fail");
        key
    }

    fn human_name(&self) -> String {
        "package-lock.json".to_string()
    }
}

impl NpmPackage {
    fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .chain(self.optional_dependencies.keys())
            .chain(self.peer_dependencies.keys())
            .map(String::as_str)
    }
}

pub fn npm_subgraph(
    contents: &[u8],
    workspace_packages: &[String],
    packages: &[String],
) -> Result<Vec<u8>, Error> {
    NpmLockfile::load(contents)?
        .subgraph(workspace_packages, packages)?
        .encode()
}

pub fn npm_global_change(prev_contents: &[u8], curr_contents: &[u8]) -> Result<bool, Error> {
    let previous = NpmLockfile::load(prev_contents)?;
    let current = NpmLockfile::load(curr_contents)?;
    Ok(super::global_change(&previous, &current))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn fixture() -> NpmLockfile {
        let raw = json!({
            "name": "fixture",
            "lockfileVersion": 3,
            "requires": true,
            "packages": {
                "": {
                    "name": "fixture",
                    "workspaces": ["apps/*", "packages/*"]
                },
                "apps/web": {
                    "version": "0.0.0",
                    "dependencies": { "lodash": "^4.17.0", "util": "*" }
                },
                "packages/util": {
                    "version": "1.0.0",
                    "dependencies": { "chalk": "^2.0.0" }
                },
                "node_modules/web": {
                    "resolved": "apps/web",
                    "link": true
                },
                "node_modules/util": {
                    "resolved": "packages/util",
                    "link": true
                },
                "node_modules/lodash": {
                    "version": "3.10.1"
                },
                "apps/web/node_modules/lodash": {
                    "version": "4.17.21"
                },
                "node_modules/chalk": {
                    "version": "2.4.2",
                    "dependencies": { "ansi-styles": "^3.2.1" }
                },
                "node_modules/ansi-styles": {
                    "version": "3.2.1"
                }
            }
        });
        NpmLockfile::load(serde_json::to_vec(&raw).unwrap().as_slice()).unwrap()
    }

    #[test_case("apps/web", "lodash", "apps/web/node_modules/lodash", "4.17.21" ; "nested install wins")]
    #[test_case("packages/util", "lodash", "node_modules/lodash", "3.10.1" ; "hoisted install")]
    #[test_case("apps/web", "chalk", "node_modules/chalk", "2.4.2" ; "root install")]
    fn test_resolve_package(workspace: &str, name: &str, key: &str, version: &str) {
        let lockfile = fixture();
        let package = lockfile.resolve_package(workspace, name, "*").unwrap();
        assert_eq!(package, Some(Package::new(key, version)));
    }

    #[test]
    fn test_resolve_package_missing_workspace() {
        let lockfile = fixture();
        assert!(matches!(
            lockfile.resolve_package("apps/missing", "lodash", "*"),
            Err(Error::MissingWorkspace(_))
        ));
    }

    #[test]
    fn test_all_dependencies_follows_hoisting() {
        let lockfile = fixture();
        let deps = lockfile
            .all_dependencies("node_modules/chalk")
            .unwrap()
            .unwrap();
        assert_eq!(
            deps,
            [("node_modules/ansi-styles".to_string(), "3.2.1".to_string())]
                .into_iter()
                .collect()
        );

        assert_eq!(lockfile.all_dependencies("node_modules/nope").unwrap(), None);
    }

    #[test]
    fn test_closure_skips_workspace_links() {
        let lockfile = fixture();
        let closure = crate::transitive_closure(
            &lockfile,
            "apps/web",
            [
                ("lodash".to_string(), "^4.17.0".to_string()),
                ("chalk".to_string(), "^2.0.0".to_string()),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap();

        let mut keys: Vec<_> = closure.iter().map(|p| p.key.as_str()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "apps/web/node_modules/lodash",
                "node_modules/ansi-styles",
                "node_modules/chalk",
            ]
        );
    }

    #[test]
    fn test_subgraph_is_idempotent() {
        let lockfile = fixture();
        let workspaces = vec!["apps/web".to_string()];
        let packages = vec![
            "apps/web/node_modules/lodash".to_string(),
            "node_modules/chalk".to_string(),
        ];

        let once = lockfile.subgraph(&workspaces, &packages).unwrap();
        let twice = once.subgraph(&workspaces, &packages).unwrap();
        assert_eq!(
            String::from_utf8(once.encode().unwrap()).unwrap(),
            String::from_utf8(twice.encode().unwrap()).unwrap(),
        );
    }

    #[test]
    fn test_encode_round_trips_unchanged() {
        let lockfile = fixture();
        let encoded = lockfile.encode().unwrap();
        let reloaded = NpmLockfile::load(&encoded).unwrap();
        assert_eq!(encoded, reloaded.encode().unwrap());
    }

    #[test]
    fn test_version_change_is_global_change() {
        let v3 = fixture();
        let mut raw: Value =
            serde_json::from_slice(&v3.encode().unwrap()).unwrap();
        raw["lockfileVersion"] = json!(2);
        let v2 = NpmLockfile::load(&serde_json::to_vec(&raw).unwrap()).unwrap();

        assert!(crate::global_change(&v3, &v2));
        assert!(!crate::global_change(&v3, &fixture()));
    }

    #[test]
    fn test_unsupported_v1_lockfile() {
        let raw = json!({
            "lockfileVersion": 1,
            "dependencies": { "lodash": { "version": "4.17.21" } }
        });
        assert!(matches!(
            NpmLockfile::load(&serde_json::to_vec(&raw).unwrap()),
            Err(Error::UnsupportedNpmVersion)
        ));
    }
}
