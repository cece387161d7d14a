#![deny(clippy::all)]
//! Glob walking rooted at an absolute path.
//!
//! Used for workspace discovery, task input hashing, and task output
//! collection. Globs are unix-style regardless of platform; matching
//! happens against the full slashed path so `..` segments in globs must be
//! collapsed before comparison.

use std::{borrow::Cow, collections::HashSet};

use glob_match::glob_match;
use itertools::Itertools;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, PathError};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WalkType {
    Files,
    Folders,
    All,
}

impl WalkType {
    fn should_emit(&self, is_dir: bool) -> bool {
        match self {
            WalkType::Files => !is_dir,
            WalkType::Folders => is_dir,
            WalkType::All => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("glob traverses out of the walk root: {0}")]
    GlobEscapesRoot(String),
    #[error("path is not valid UTF-8: {0}")]
    InvalidPath(String),
    #[error("walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Performs a glob walk, yielding paths that are included by `include` and
/// not matched by `exclude`. An empty include list matches everything under
/// `base_path`.
pub fn globwalk(
    base_path: &AbsoluteSystemPath,
    include: &[String],
    exclude: &[String],
    walk_type: WalkType,
) -> Result<HashSet<AbsoluteSystemPathBuf>, WalkError> {
    let matcher = GlobSet::build(base_path, include, exclude)?;
    let walk_root = matcher.walk_root().to_owned();

    let mut results = HashSet::new();
    let mut iter = walkdir::WalkDir::new(walk_root.as_std_path())
        .follow_links(false)
        .into_iter();

    while let Some(entry) = iter.next() {
        let entry = match entry {
            Ok(entry) => entry,
            // Yield broken symlinks rather than erroring out of the walk.
            Err(err) => match (err.io_error(), err.path()) {
                (Some(io_err), Some(path))
                    if io_err.kind() == std::io::ErrorKind::NotFound && path.is_symlink() =>
                {
                    continue;
                }
                _ => return Err(err.into()),
            },
        };

        let is_symlink = entry.path_is_symlink();
        let is_dir = !is_symlink && entry.file_type().is_dir();
        let path = entry.path();
        let Some(path_str) = path.to_str() else {
            return Err(WalkError::InvalidPath(path.to_string_lossy().into_owned()));
        };
        let unix_path = slashed(path_str);

        if is_dir && matcher.is_excluded(&unix_path) {
            iter.skip_current_dir();
            continue;
        }
        // Symlinked directories are yielded but never traversed.
        if is_symlink && path.is_dir() {
            iter.skip_current_dir();
        }

        if walk_type.should_emit(is_dir) && matcher.is_match(&unix_path) {
            results.insert(AbsoluteSystemPathBuf::new(path_str.to_string())?);
        }
    }

    Ok(results)
}

struct GlobSet {
    walk_root: AbsoluteSystemPathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl GlobSet {
    fn build(
        base_path: &AbsoluteSystemPath,
        include: &[String],
        exclude: &[String],
    ) -> Result<Self, WalkError> {
        let base = slashed(base_path.as_str());

        let mut include_globs = Vec::new();
        let mut lowest_segment = usize::MAX;
        for raw in include {
            let joined = join_unix_like_paths(&base, raw);
            let (collapsed, first_collapse) =
                collapse_path(&joined).ok_or_else(|| WalkError::GlobEscapesRoot(raw.clone()))?;
            lowest_segment = lowest_segment.min(first_collapse);
            include_globs.push(collapsed.into_owned());
        }
        if include.is_empty() {
            // Everything under the base matches.
            include_globs.push(format!("{}/**", base.trim_end_matches('/')));
        }

        let mut exclude_globs = Vec::new();
        for raw in exclude {
            let joined = join_unix_like_paths(&base, raw);
            let (collapsed, _) =
                collapse_path(&joined).ok_or_else(|| WalkError::GlobEscapesRoot(raw.clone()))?;
            let collapsed = collapsed.into_owned();
            // An exclusion covers itself and everything beneath it.
            if let Some(prefix) = collapsed.strip_suffix('/') {
                exclude_globs.push(format!("{prefix}/**"));
            } else if collapsed.ends_with("/**") {
                exclude_globs.push(collapsed);
            } else {
                exclude_globs.push(format!("{collapsed}/**"));
                exclude_globs.push(collapsed);
            }
        }

        // The walk starts at the deepest directory shared by every include:
        // base components up to the first glob or collapsed segment.
        let walk_root = if lowest_segment == usize::MAX {
            let static_depth = include_globs
                .iter()
                .map(|glob| static_segment_count(glob))
                .min()
                .unwrap_or(0);
            let prefix = base_path
                .components()
                .take(static_depth.saturating_add(1))
                .collect::<camino::Utf8PathBuf>();
            AbsoluteSystemPathBuf::new(prefix.into_string())?
        } else {
            let prefix = base_path
                .components()
                .take(lowest_segment.saturating_add(1))
                .collect::<camino::Utf8PathBuf>();
            AbsoluteSystemPathBuf::new(prefix.into_string())?
        };

        Ok(Self {
            walk_root,
            include: include_globs,
            exclude: exclude_globs,
        })
    }

    fn walk_root(&self) -> &AbsoluteSystemPath {
        &self.walk_root
    }

    fn is_match(&self, unix_path: &str) -> bool {
        self.include.iter().any(|glob| glob_match(glob, unix_path))
            && !self.is_excluded(unix_path)
    }

    fn is_excluded(&self, unix_path: &str) -> bool {
        self.exclude.iter().any(|glob| glob_match(glob, unix_path))
    }
}

fn slashed(path: &str) -> String {
    if cfg!(windows) {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}

fn join_unix_like_paths(a: &str, b: &str) -> String {
    [a.trim_end_matches('/'), "/", b.trim_start_matches('/')].concat()
}

/// The number of leading segments of a glob that contain no metacharacters.
fn static_segment_count(glob: &str) -> usize {
    glob.trim_start_matches('/')
        .split('/')
        .take_while(|segment| !segment.contains(['*', '?', '[', ']', '{', '}']))
        .count()
}

/// Collapses `.` and `..` segments lexically, returning the collapsed path
/// and the index of the lowest segment touched by a collapse. Returns
/// `None` when `..` traverses above the root.
fn collapse_path(path: &str) -> Option<(Cow<'_, str>, usize)> {
    let mut stack: Vec<&str> = vec![];
    let mut changed = false;
    let is_root = path.starts_with('/');

    let mut lowest_index = None;

    for segment in path.trim_start_matches('/').split('/') {
        match segment {
            ".." => {
                stack.pop()?;
                lowest_index.get_or_insert(stack.len());
                changed = true;
            }
            "." => {
                lowest_index.get_or_insert(stack.len());
                changed = true;
            }
            _ => stack.push(segment),
        }
        if let Some(lowest_index) = lowest_index.as_mut() {
            *lowest_index = (*lowest_index).min(stack.len());
        }
    }

    let lowest_index = lowest_index.unwrap_or(stack.len());
    if !changed {
        Some((Cow::Borrowed(path), lowest_index))
    } else {
        let collapsed = if is_root {
            std::iter::once("").chain(stack).join("/")
        } else {
            stack.join("/")
        };
        Some((Cow::Owned(collapsed), lowest_index))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("/a/b/./c", "/a/b/c", 1 ; "single dot")]
    #[test_case("/a/b/../c", "/a/c", 1 ; "dot dot")]
    #[test_case("/a/b/c", "/a/b/c", 3 ; "no change")]
    fn test_collapse_path(input: &str, expected: &str, expected_index: usize) {
        let (collapsed, index) = collapse_path(input).unwrap();
        assert_eq!(collapsed, expected);
        assert_eq!(index, expected_index);
    }

    #[test]
    fn test_collapse_path_escaping_root() {
        assert!(collapse_path("../a").is_none());
        assert!(collapse_path("a/../../b").is_none());
    }

    fn setup() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in [
            "packages/ui/src",
            "packages/util",
            "apps/web",
            "node_modules/lodash",
            "packages/ui/node_modules/chalk",
        ] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        for file in [
            "package.json",
            "packages/ui/package.json",
            "packages/ui/src/index.ts",
            "packages/util/package.json",
            "apps/web/package.json",
            "node_modules/lodash/package.json",
            "packages/ui/node_modules/chalk/package.json",
        ] {
            std::fs::write(root.join(file), "{}").unwrap();
        }
        tmp
    }

    fn walk(
        tmp: &tempfile::TempDir,
        include: &[&str],
        exclude: &[&str],
        walk_type: WalkType,
    ) -> Vec<String> {
        let root = AbsoluteSystemPathBuf::new(tmp.path().to_str().unwrap().to_string()).unwrap();
        let include: Vec<_> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<_> = exclude.iter().map(|s| s.to_string()).collect();
        let mut results: Vec<_> = globwalk(&root, &include, &exclude, walk_type)
            .unwrap()
            .into_iter()
            .map(|p| {
                root.anchor(&p)
                    .unwrap()
                    .to_unix()
                    .as_str()
                    .to_string()
            })
            .collect();
        results.sort();
        results
    }

    #[test]
    fn test_workspace_discovery() {
        let tmp = setup();
        let found = walk(
            &tmp,
            &["packages/*/package.json"],
            &["**/node_modules/**"],
            WalkType::Files,
        );
        assert_eq!(
            found,
            vec!["packages/ui/package.json", "packages/util/package.json"]
        );
    }

    #[test]
    fn test_exclusion_prunes_subtrees() {
        let tmp = setup();
        let found = walk(
            &tmp,
            &["**/package.json"],
            &["**/node_modules/**"],
            WalkType::Files,
        );
        assert_eq!(
            found,
            vec![
                "apps/web/package.json",
                "package.json",
                "packages/ui/package.json",
                "packages/util/package.json",
            ]
        );
    }

    #[test]
    fn test_empty_include_matches_all_files() {
        let tmp = setup();
        let found = walk(&tmp, &[], &["node_modules/**", "packages/**"], WalkType::Files);
        assert_eq!(found, vec!["apps/web/package.json", "package.json"]);
    }

    #[test]
    fn test_folder_walk() {
        let tmp = setup();
        let found = walk(&tmp, &["packages/*"], &[], WalkType::Folders);
        assert_eq!(found, vec!["packages/ui", "packages/util"]);
    }
}
