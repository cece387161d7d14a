//! Maps changed files to changed packages, for affected-set computation.

use std::collections::HashSet;

use turbopath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};

use crate::package_graph::{PackageGraph, PackageName};

/// The contents of the lockfile as of the comparison ref, when the
/// lockfile is among the changed files. The contents may be unavailable
/// (e.g. the file did not exist at that ref), which still expresses a
/// change.
pub enum LockfileChange {
    Empty,
    WithContent(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PackageChanges {
    /// Everything must be considered changed, e.g. a global dependency or
    /// the lockfile format changed.
    All,
    Some(HashSet<PackageName>),
}

pub struct ChangeMapper<'a> {
    pkg_graph: &'a PackageGraph,
    global_deps: Vec<String>,
}

impl<'a> ChangeMapper<'a> {
    pub fn new(pkg_graph: &'a PackageGraph, global_deps: Vec<String>) -> Self {
        Self {
            pkg_graph,
            global_deps,
        }
    }

    pub fn lockfile_changed(
        turbo_root: &AbsoluteSystemPath,
        changed_files: &HashSet<AnchoredSystemPathBuf>,
        lockfile_path: &AbsoluteSystemPath,
    ) -> bool {
        let lockfile_path_relative = turbo_root
            .anchor(lockfile_path)
            .expect("lockfile is inside the repo");
        changed_files.iter().any(|f| f == &lockfile_path_relative)
    }

    pub fn changed_packages(
        &self,
        changed_files: HashSet<AnchoredSystemPathBuf>,
        lockfile_change: Option<LockfileChange>,
    ) -> Result<PackageChanges, Error> {
        // A changed global dependency invalidates every package.
        if self.global_deps_changed(&changed_files) {
            return Ok(PackageChanges::All);
        }

        let mut changed = HashSet::new();
        for file in &changed_files {
            match self.package_containing(file) {
                Some(name) => {
                    changed.insert(name);
                }
                // A file outside every package belongs to the root.
                None => {
                    changed.insert(PackageName::Root);
                }
            }
        }

        match lockfile_change {
            Some(LockfileChange::WithContent(content)) => {
                let Ok(previous) = self.pkg_graph.package_manager().parse_lockfile(&content)
                else {
                    return Ok(PackageChanges::All);
                };
                match self.pkg_graph.changed_packages_from_lockfile(previous.as_ref()) {
                    Ok(lockfile_changes) => {
                        changed.extend(lockfile_changes);
                        Ok(PackageChanges::Some(changed))
                    }
                    Err(_) => Ok(PackageChanges::All),
                }
            }
            // Without prior contents there is nothing to diff against.
            Some(LockfileChange::Empty) => Ok(PackageChanges::All),
            None => Ok(PackageChanges::Some(changed)),
        }
    }

    fn global_deps_changed(&self, changed_files: &HashSet<AnchoredSystemPathBuf>) -> bool {
        changed_files.iter().any(|file| {
            let unix = file.to_unix();
            self.global_deps
                .iter()
                .any(|glob| glob_match::glob_match(glob, unix.as_str()))
        })
    }

    fn package_containing(&self, file: &AnchoredSystemPath) -> Option<PackageName> {
        self.pkg_graph
            .packages()
            .filter(|(name, _)| !matches!(name, PackageName::Root))
            .find(|(_, info)| {
                let package_path = info.package_path();
                file.components()
                    .zip(package_path.components())
                    .take_while(|(a, b)| a == b)
                    .count()
                    == package_path.components().count()
            })
            .map(|(name, _)| name.clone())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    PackageManager(#[from] crate::package_manager::Error),
    #[error("lockfile error: {0}")]
    Lockfile(#[from] turborepo_lockfiles::Error),
}
