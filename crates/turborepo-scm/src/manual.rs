//! Filesystem-walk hashing for when git is unavailable or when a task
//! declares explicit inputs.

use globwalk::{globwalk, WalkType};
use ignore::WalkBuilder;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::{hash_object::hash_file, Error, GitHashes};

/// Hashes the files matching `inputs` globs under `package_path`,
/// resolved relative to the package directory.
pub(crate) fn hash_package_inputs(
    package_root: &AbsoluteSystemPath,
    inputs: &[String],
    exclusions: &[String],
) -> Result<GitHashes, Error> {
    let mut hashes = GitHashes::new();
    let files = globwalk(package_root, inputs, exclusions, WalkType::Files)?;
    for file in files {
        let anchored = package_root.anchor(&file)?;
        hashes.insert(anchored.to_unix(), hash_file(&file)?);
    }
    Ok(hashes)
}

/// Hashes every non-ignored file under `package_path`, honoring
/// `.gitignore` files the way git itself would.
pub(crate) fn hash_package_tree(package_root: &AbsoluteSystemPath) -> Result<GitHashes, Error> {
    let mut hashes = GitHashes::new();
    let walker = WalkBuilder::new(package_root.as_std_path())
        .hidden(false)
        .require_git(false)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(false)
        .build();
    for entry in walker {
        let entry = entry?;
        let is_file = entry
            .file_type()
            .map_or(false, |ft| ft.is_file() || ft.is_symlink());
        if !is_file {
            continue;
        }
        // .git directories are never inputs.
        let file = AbsoluteSystemPath::from_std_path(entry.path())?;
        let anchored = package_root.anchor(&file)?;
        if anchored
            .components()
            .any(|c| c.as_str() == ".git")
        {
            continue;
        }
        hashes.insert(anchored.to_unix(), hash_file(&file)?);
    }
    Ok(hashes)
}

/// Hashes a fixed list of files if they exist, keyed by the given anchored
/// paths. Used for .env files, which contribute to hashes even when
/// gitignored.
pub(crate) fn hash_existing_of(
    base: &AbsoluteSystemPath,
    files: impl IntoIterator<Item = AnchoredSystemPathBuf>,
) -> Result<GitHashes, Error> {
    let mut hashes = GitHashes::new();
    for file in files {
        let full_path = base.resolve(&file);
        match full_path.symlink_metadata() {
            Ok(_) => {
                hashes.insert(file.to_unix(), hash_file(&full_path)?);
            }
            Err(e) if e.is_io_error(std::io::ErrorKind::NotFound) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, turbopath::AbsoluteSystemPathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root =
            turbopath::AbsoluteSystemPathBuf::from_std_path(&tmp.path().canonicalize().unwrap())
                .unwrap();
        (tmp, root)
    }

    #[test]
    fn test_hash_package_tree_respects_gitignore() {
        let (_tmp, root) = setup();
        root.join_component(".gitignore")
            .create_with_contents("dist/\n")
            .unwrap();
        root.join_component("index.ts")
            .create_with_contents("export {}")
            .unwrap();
        root.join_component("dist").create_dir_all().unwrap();
        root.join_components(&["dist", "index.js"])
            .create_with_contents("ignored")
            .unwrap();

        let hashes = hash_package_tree(&root).unwrap();
        let mut paths: Vec<_> = hashes.keys().map(|p| p.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec![".gitignore", "index.ts"]);
    }

    #[test]
    fn test_hash_package_inputs_only_matches_globs() {
        let (_tmp, root) = setup();
        root.join_component("src").create_dir_all().unwrap();
        root.join_components(&["src", "main.ts"])
            .create_with_contents("a")
            .unwrap();
        root.join_components(&["src", "main.test.ts"])
            .create_with_contents("b")
            .unwrap();
        root.join_component("README.md")
            .create_with_contents("c")
            .unwrap();

        let hashes = hash_package_inputs(
            &root,
            &["src/**/*.ts".to_string()],
            &["src/**/*.test.ts".to_string()],
        )
        .unwrap();
        let mut paths: Vec<_> = hashes.keys().map(|p| p.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["src/main.ts"]);
    }
}
