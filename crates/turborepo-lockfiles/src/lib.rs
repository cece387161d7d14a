#![deny(clippy::all)]
//! Lockfile abstraction for the task runner.
//!
//! A lockfile answers three questions: what does a `(workspace, name,
//! range)` triple resolve to, what does a resolved key depend on, and which
//! entries survive a prune to a subset of workspaces. Dialects are a fixed,
//! known set, so callers hold a `Box<dyn Lockfile>` produced by the package
//! manager layer and never inspect the concrete type.

mod error;
mod npm;

use std::collections::{HashMap, HashSet};

pub use error::Error;
pub use npm::{npm_global_change, npm_subgraph, NpmLockfile};
use rayon::prelude::*;
use serde::Serialize;
use turbopath::RelativeUnixPathBuf;

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord, Hash, Serialize)]
pub struct Package {
    pub key: String,
    pub version: String,
}

impl Package {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
        }
    }
}

pub trait Lockfile: Send + Sync {
    /// Resolves a dependency declared by a workspace to its lockfile entry.
    /// A malformed declaration is an error; a missing entry is `Ok(None)`.
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>, Error>;

    /// All dependencies (prod, dev, optional) of a resolved key.
    /// `Ok(None)` if the key has no entry.
    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error>;

    /// A new lockfile containing exactly the given workspaces and resolved
    /// keys. Patch references for retained keys are preserved.
    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error>;

    /// Deterministic byte encoding; unchanged inputs round-trip
    /// byte-identically.
    fn encode(&self) -> Result<Vec<u8>, Error>;

    /// Paths of all patch files referenced by the lockfile, anchored at the
    /// repo root.
    fn patches(&self) -> Result<Vec<RelativeUnixPathBuf>, Error> {
        Ok(Vec::new())
    }

    /// Opaque key covering everything that, when changed, invalidates all
    /// caches: dialect, format version, top-level resolution settings.
    /// Prefixed with a dialect magic so keys never collide across dialects.
    fn global_change_key(&self) -> Vec<u8>;

    fn human_name(&self) -> String;
}

/// Do two lockfiles differ in a way that invalidates every cache entry?
/// A dialect change is always a global change.
pub fn global_change(previous: &dyn Lockfile, current: &dyn Lockfile) -> bool {
    previous.global_change_key() != current.global_change_key()
}

/// Calculates the transitive closure of external packages for every
/// workspace, fanning the workspaces out across threads.
pub fn all_transitive_closures<L: Lockfile + ?Sized>(
    lockfile: &L,
    workspaces: HashMap<String, HashMap<String, String>>,
) -> Result<HashMap<String, HashSet<Package>>, Error> {
    workspaces
        .into_par_iter()
        .map(|(workspace, unresolved_deps)| {
            let closure = transitive_closure(lockfile, &workspace, unresolved_deps)?;
            Ok((workspace, closure))
        })
        .collect()
}

/// Every lockfile entry reachable from a workspace's direct dependencies.
pub fn transitive_closure<L: Lockfile + ?Sized>(
    lockfile: &L,
    workspace_path: &str,
    unresolved_deps: HashMap<String, String>,
) -> Result<HashSet<Package>, Error> {
    let mut closure = HashSet::new();
    let mut queue: Vec<(String, String)> = unresolved_deps.into_iter().collect();

    while let Some((name, specifier)) = queue.pop() {
        let Some(package) = lockfile.resolve_package(workspace_path, &name, &specifier)? else {
            continue;
        };
        if !closure.insert(package.clone()) {
            continue;
        }
        if let Some(dependencies) = lockfile.all_dependencies(&package.key)? {
            queue.extend(dependencies);
        }
    }

    Ok(closure)
}
