//! Entry points for hashing a package's input files.

use turbopath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};

use crate::{hash_object, manual, Error, Git, GitHashes, SCM};

impl SCM {
    /// Hashes the input file set for one package, keyed relative to the
    /// package directory.
    ///
    /// With explicit `inputs` globs the file set is the glob matches plus
    /// the package manifest; otherwise it is every tracked file in the
    /// package directory, corrected for uncommitted edits. Without git the
    /// tracked-file set degrades to a gitignore-aware walk.
    pub fn get_package_file_hashes(
        &self,
        turbo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
        inputs: &[String],
    ) -> Result<GitHashes, Error> {
        let package_root = turbo_root.resolve(package_path);
        if !inputs.is_empty() {
            return hash_inputs_with_manifest(&package_root, inputs);
        }
        match self {
            SCM::Git(git) => {
                match git.hash_tracked_files(turbo_root, package_path) {
                    Ok(hashes) => Ok(hashes),
                    // A repo without a HEAD commit still needs hashes.
                    Err(e) => {
                        tracing::debug!(
                            "git hashing failed ({e}), falling back to manual walk for {package_path}"
                        );
                        manual::hash_package_tree(&package_root)
                    }
                }
            }
            SCM::Manual => manual::hash_package_tree(&package_root),
        }
    }

    /// Hashes a fixed list of package-relative files that exist, e.g.
    /// declared .env files.
    pub fn hash_existing_of(
        &self,
        package_root: &AbsoluteSystemPath,
        files: impl IntoIterator<Item = AnchoredSystemPathBuf>,
    ) -> Result<GitHashes, Error> {
        manual::hash_existing_of(package_root, files)
    }
}

fn hash_inputs_with_manifest(
    package_root: &AbsoluteSystemPath,
    inputs: &[String],
) -> Result<GitHashes, Error> {
    let (inclusions, exclusions): (Vec<_>, Vec<_>) = inputs
        .iter()
        .cloned()
        .partition(|glob| !glob.starts_with('!'));
    let exclusions: Vec<_> = exclusions
        .into_iter()
        .map(|glob| glob[1..].to_string())
        .collect();

    let mut hashes = manual::hash_package_inputs(package_root, &inclusions, &exclusions)?;
    // The manifest always contributes, whether or not the globs cover it.
    manual::hash_existing_of(
        package_root,
        [AnchoredSystemPathBuf::from_raw("package.json")?],
    )?
    .into_iter()
    .for_each(|(path, hash)| {
        hashes.insert(path, hash);
    });
    Ok(hashes)
}

impl Git {
    fn hash_tracked_files(
        &self,
        turbo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
    ) -> Result<GitHashes, Error> {
        // Both ls-tree and status give paths relative to the git root,
        // which may sit above the turbo root.
        let package_root = turbo_root.resolve(package_path);
        let git_relative_package = self.root.anchor(&package_root)?.to_unix();

        let committed = self.ls_tree(git_relative_package.as_str())?;
        let mut hashes = GitHashes::new();
        for (path, hash) in committed {
            let package_relative = path.strip_prefix(&git_relative_package)?;
            hashes.insert(package_relative.to_owned(), hash);
        }

        let changes = self.status(git_relative_package.as_str())?;
        for deleted in changes.to_delete {
            let package_relative = deleted.strip_prefix(&git_relative_package)?;
            hashes.remove(package_relative);
        }
        let to_hash = changes
            .to_hash
            .into_iter()
            .map(|path| {
                path.strip_prefix(&git_relative_package)
                    .map(ToOwned::to_owned)
            })
            .collect::<Result<Vec<_>, _>>()?;
        hash_object::hash_files(&package_root, to_hash, &mut hashes)?;
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::test_git::{commit_all, init_repo};

    fn tmp_root(tmp: &tempfile::TempDir) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap()
    }

    #[test]
    fn test_git_and_manual_hashing_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp_root(&tmp);
        let pkg_dir = root.join_components(&["packages", "ui"]);
        pkg_dir.create_dir_all().unwrap();
        pkg_dir
            .join_component("package.json")
            .create_with_contents(r#"{"name":"ui"}"#)
            .unwrap();
        pkg_dir
            .join_component("index.ts")
            .create_with_contents("export {}")
            .unwrap();

        let package_path = AnchoredSystemPathBuf::from_raw(if cfg!(windows) {
            "packages\\ui"
        } else {
            "packages/ui"
        })
        .unwrap();

        let manual_hashes = SCM::Manual
            .get_package_file_hashes(&root, &package_path, &[])
            .unwrap();
        assert_eq!(manual_hashes.len(), 2);

        if !init_repo(&root) {
            return;
        }
        commit_all(&root, "initial");
        let scm = SCM::new(&root);
        assert!(!scm.is_manual());
        let git_hashes = scm
            .get_package_file_hashes(&root, &package_path, &[])
            .unwrap();
        assert_eq!(git_hashes, manual_hashes);
    }

    #[test]
    fn test_uncommitted_edits_change_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp_root(&tmp);
        let pkg_dir = root.join_components(&["packages", "ui"]);
        pkg_dir.create_dir_all().unwrap();
        let index = pkg_dir.join_component("index.ts");
        index.create_with_contents("one").unwrap();

        if !init_repo(&root) {
            return;
        }
        commit_all(&root, "initial");
        let scm = SCM::new(&root);
        let package_path = AnchoredSystemPathBuf::from_raw(if cfg!(windows) {
            "packages\\ui"
        } else {
            "packages/ui"
        })
        .unwrap();

        let before = scm
            .get_package_file_hashes(&root, &package_path, &[])
            .unwrap();
        index.create_with_contents("two").unwrap();
        let after = scm
            .get_package_file_hashes(&root, &package_path, &[])
            .unwrap();

        let key = turbopath::RelativeUnixPathBuf::new("index.ts").unwrap();
        assert_ne!(before[&key], after[&key]);
    }

    #[test]
    fn test_explicit_inputs_include_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp_root(&tmp);
        root.join_component("package.json")
            .create_with_contents(r#"{"name":"app"}"#)
            .unwrap();
        root.join_component("src").create_dir_all().unwrap();
        root.join_components(&["src", "main.ts"])
            .create_with_contents("x")
            .unwrap();
        root.join_component("README.md")
            .create_with_contents("docs")
            .unwrap();

        let package_path = AnchoredSystemPathBuf::from_raw("").unwrap();
        let hashes = SCM::Manual
            .get_package_file_hashes(&root, &package_path, &["src/**".to_string()])
            .unwrap();
        let mut paths: Vec<_> = hashes.keys().map(|p| p.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["package.json", "src/main.ts"]);
    }
}
