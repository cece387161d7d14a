use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use turbopath::AbsoluteSystemPath;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<Workspaces>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
}

/// The `workspaces` field: either a bare list of globs or a mapping with a
/// `packages` key holding the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Workspaces {
    TopLevel(Vec<String>),
    Nested { packages: Vec<String> },
}

impl Workspaces {
    pub fn globs(&self) -> &[String] {
        match self {
            Workspaces::TopLevel(globs) => globs,
            Workspaces::Nested { packages } => packages,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {error}")]
    Io {
        path: String,
        error: turbopath::PathError,
    },
    #[error("unable to parse {path}: {error}")]
    Parse {
        path: String,
        error: serde_json::Error,
    },
}

impl PackageJson {
    pub fn load(path: &AbsoluteSystemPath) -> Result<PackageJson, Error> {
        let contents = path.read_to_string().map_err(|error| Error::Io {
            path: path.to_string(),
            error,
        })?;
        serde_json::from_str(&contents).map_err(|error| Error::Parse {
            path: path.to_string(),
            error,
        })
    }

    /// All dependency buckets merged into one map. Regular dependencies win
    /// on collision, then optional, then dev.
    pub fn all_dependencies(&self) -> BTreeMap<&str, &str> {
        let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
        for bucket in [
            &self.dev_dependencies,
            &self.optional_dependencies,
            &self.dependencies,
        ] {
            for (name, version) in bucket {
                merged.insert(name, version);
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspaces_formats() {
        let top: PackageJson =
            serde_json::from_str(r#"{"workspaces": ["packages/*"]}"#).unwrap();
        let nested: PackageJson =
            serde_json::from_str(r#"{"workspaces": {"packages": ["packages/*"]}}"#).unwrap();
        assert_eq!(top.workspaces.unwrap().globs(), ["packages/*"]);
        assert_eq!(nested.workspaces.unwrap().globs(), ["packages/*"]);
    }

    #[test]
    fn test_all_dependencies_precedence() {
        let manifest: PackageJson = serde_json::from_str(
            r#"{
                "dependencies": { "shared": "^2.0.0", "prod-only": "1.0.0" },
                "devDependencies": { "shared": "^1.0.0", "dev-only": "1.0.0" },
                "optionalDependencies": { "shared": "^1.5.0", "opt-only": "1.0.0" }
            }"#,
        )
        .unwrap();

        let merged = manifest.all_dependencies();
        assert_eq!(merged["shared"], "^2.0.0");
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let manifest: PackageJson = serde_json::from_str(
            r#"{"name": "app", "description": "a package", "license": "MIT"}"#,
        )
        .unwrap();
        assert_eq!(manifest.name.as_deref(), Some("app"));
    }
}
