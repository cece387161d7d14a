//! Classification of declared dependencies as internal (workspace) or
//! external (registry) references.

use std::{collections::HashMap, fmt};

use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};

use super::PackageName;

/// Splits a package's declared dependencies into internal and external
/// sets, given the full name -> (version, dir) map of the workspace.
pub struct DependencySplitter<'a> {
    repo_root: &'a AbsoluteSystemPath,
    workspace_dir: &'a AbsoluteSystemPath,
    workspaces: &'a HashMap<String, WorkspacePackageInfo>,
}

#[derive(Debug, Clone)]
pub struct WorkspacePackageInfo {
    pub name: PackageName,
    /// The version declared in the workspace package's manifest; empty when
    /// undeclared.
    pub version: String,
}

impl<'a> DependencySplitter<'a> {
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        workspace_dir: &'a AbsoluteSystemPath,
        workspaces: &'a HashMap<String, WorkspacePackageInfo>,
    ) -> Self {
        Self {
            repo_root,
            workspace_dir,
            workspaces,
        }
    }

    /// Returns the internal package this declaration refers to, or `None`
    /// when the dependency is external.
    pub fn is_internal(&self, name: &str, range: &str) -> Option<PackageName> {
        let version = DependencyVersion::new(range);
        let workspace = self.workspaces.get(name)?;
        version
            .matches_workspace_package(&workspace.version, self.workspace_dir, self.repo_root)
            .then(|| workspace.name.clone())
    }
}

struct DependencyVersion<'a> {
    protocol: Option<&'a str>,
    version: &'a str,
}

impl<'a> DependencyVersion<'a> {
    fn new(qualified_version: &'a str) -> Self {
        qualified_version.split_once(':').map_or(
            Self {
                protocol: None,
                version: qualified_version,
            },
            |(protocol, version)| Self {
                protocol: Some(protocol),
                version,
            },
        )
    }

    fn is_external_protocol(&self) -> bool {
        // The npm: protocol can still point at the workspace copy when the
        // version range is compatible. Every other protocol ("github:",
        // "git:", ...) is a registry/remote reference.
        self.protocol.map_or(false, |p| p != "npm")
    }

    fn matches_workspace_package(
        &self,
        package_version: &str,
        cwd: &AbsoluteSystemPath,
        root: &AbsoluteSystemPath,
    ) -> bool {
        match self.protocol {
            Some("workspace") => true,
            Some("file") | Some("link") => {
                // Internal iff the referenced path stays inside the repo.
                let target = AbsoluteSystemPathBuf::from_unknown(cwd, self.version.to_string());
                root.contains(&target)
            }
            Some(_) if self.is_external_protocol() => false,
            _ if self.version == "*" => true,
            _ => {
                // A plain range refers to the workspace copy when that
                // copy's version satisfies it. Unparseable ranges and
                // versions are treated as internal references for backwards
                // compatibility.
                let range = node_semver::Range::parse(self.version);
                let version = node_semver::Version::parse(package_version);
                range
                    .ok()
                    .zip(version.ok())
                    .map_or(true, |(range, version)| range.satisfies(&version))
            }
        }
    }
}

impl<'a> fmt::Display for DependencyVersion<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Some(protocol) => write!(f, "{}:{}", protocol, self.version),
            None => f.write_str(self.version),
        }
    }
}
