use std::collections::HashSet;

use globwalk::{globwalk, WalkType};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_lockfiles::{Lockfile, NpmLockfile};

use crate::package_json::PackageJson;

pub const LOCKFILE: &str = "package-lock.json";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no workspace definition found in package.json")]
    NoWorkspaceGlobs,
    #[error(transparent)]
    Walk(#[from] globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error("unable to read lockfile: {0}")]
    Lockfile(#[from] turborepo_lockfiles::Error),
    #[error(transparent)]
    PackageJson(#[from] crate::package_json::Error),
}

/// Workspace globs split into inclusions and `!`-prefixed exclusions, with
/// the package-manager's implicit exclusions appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceGlobs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

impl WorkspaceGlobs {
    fn new(raw_globs: &[String], implicit_exclusions: &[&str]) -> Self {
        let mut inclusions = Vec::new();
        let mut exclusions: Vec<String> =
            implicit_exclusions.iter().map(|s| s.to_string()).collect();
        for glob in raw_globs {
            if let Some(exclusion) = glob.strip_prefix('!') {
                exclusions.push(normalize_glob(exclusion));
            } else {
                inclusions.push(normalize_glob(glob));
            }
        }
        Self {
            inclusions,
            exclusions,
        }
    }

    /// Whether a repo-relative unix path is matched by these globs.
    pub fn test(&self, unix_path: &str) -> bool {
        let included = self
            .inclusions
            .iter()
            .any(|glob| glob_match::glob_match(glob, unix_path));
        let excluded = self
            .exclusions
            .iter()
            .any(|glob| glob_match::glob_match(glob, unix_path));
        included && !excluded
    }
}

/// `./packages/*` and `packages/*` must match the same set of directories,
/// so a single leading `./` is stripped before matching.
fn normalize_glob(glob: &str) -> String {
    glob.strip_prefix("./").unwrap_or(glob).to_string()
}

/// The workspace's package manager. A fixed, known set; currently only the
/// npm layout is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageManager::Npm => f.write_str("npm"),
        }
    }
}

impl PackageManager {
    /// The binary used to run package scripts.
    pub fn command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
        }
    }

    /// The separator inserted before user-supplied pass-through args.
    pub fn arg_separator(&self) -> Option<&'static str> {
        match self {
            PackageManager::Npm => Some("--"),
        }
    }

    pub fn lockfile_name(&self) -> &'static str {
        match self {
            PackageManager::Npm => LOCKFILE,
        }
    }

    pub fn lockfile_path(&self, repo_root: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
        repo_root.join_component(self.lockfile_name())
    }

    pub fn workspace_glob_default_exclusions(&self) -> &'static [&'static str] {
        match self {
            PackageManager::Npm => &["**/node_modules/**"],
        }
    }

    pub fn get_workspace_globs(
        &self,
        root_package_json: &PackageJson,
    ) -> Result<WorkspaceGlobs, Error> {
        let raw = root_package_json
            .workspaces
            .as_ref()
            .map(|workspaces| workspaces.globs())
            .ok_or(Error::NoWorkspaceGlobs)?;
        Ok(WorkspaceGlobs::new(
            raw,
            self.workspace_glob_default_exclusions(),
        ))
    }

    /// Every workspace manifest matched by the workspace globs, excluding
    /// the root manifest.
    pub fn get_package_jsons(
        &self,
        repo_root: &AbsoluteSystemPath,
        root_package_json: &PackageJson,
    ) -> Result<HashSet<AbsoluteSystemPathBuf>, Error> {
        let globs = self.get_workspace_globs(root_package_json)?;
        let manifest_globs: Vec<String> = globs
            .inclusions
            .iter()
            .map(|glob| format!("{}/package.json", glob.trim_end_matches('/')))
            .collect();
        let mut paths = globwalk(repo_root, &manifest_globs, &globs.exclusions, WalkType::Files)?;
        paths.remove(&repo_root.join_component("package.json"));
        Ok(paths)
    }

    /// Reads and parses the lockfile. Missing lockfiles are not fatal at
    /// this layer; graph construction proceeds without external closures.
    pub fn read_lockfile(
        &self,
        repo_root: &AbsoluteSystemPath,
    ) -> Result<Option<Box<dyn Lockfile>>, Error> {
        let path = self.lockfile_path(repo_root);
        let contents = match path.read() {
            Ok(contents) => contents,
            Err(e) if e.is_io_error(std::io::ErrorKind::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let lockfile = match self {
            PackageManager::Npm => NpmLockfile::load(&contents)?,
        };
        Ok(Some(Box::new(lockfile)))
    }

    /// Parses raw lockfile contents, e.g. a prior version retrieved from
    /// source control.
    pub fn parse_lockfile(&self, contents: &[u8]) -> Result<Box<dyn Lockfile>, Error> {
        match self {
            PackageManager::Npm => Ok(Box::new(NpmLockfile::load(contents)?)),
        }
    }
}
