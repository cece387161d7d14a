#[cfg(not(windows))]
use std::os::unix::fs::symlink as symlink_file;
#[cfg(not(windows))]
use std::os::unix::fs::symlink as symlink_dir;
#[cfg(not(windows))]
use std::os::unix::fs::PermissionsExt;
#[cfg(windows)]
use std::os::windows::fs::{symlink_dir, symlink_file};
use std::{
    fmt,
    fs::{self, File, Metadata, OpenOptions},
    path::Path,
};

use camino::{Utf8Component, Utf8Components, Utf8Path, Utf8PathBuf};

use crate::{
    clean, to_system_separators, AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf,
    PathError, RelativeUnixPath,
};

/// How two absolute paths relate to each other lexically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRelation {
    Parent,
    Child,
    Divergent,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Utf8Path);

impl ToOwned for AbsoluteSystemPath {
    type Owned = AbsoluteSystemPathBuf;

    fn to_owned(&self) -> Self::Owned {
        AbsoluteSystemPathBuf(self.0.to_owned())
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPath {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<Path> for AbsoluteSystemPath {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl AsRef<Utf8Path> for AbsoluteSystemPath {
    fn as_ref(&self) -> &Utf8Path {
        &self.0
    }
}

impl fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AbsoluteSystemPath {
    /// Validates that the given path is absolute and wraps it.
    /// No normalization or separator conversion is performed; use
    /// `AbsoluteSystemPathBuf::new` for inputs of unknown provenance.
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path: &Utf8Path = path
            .try_into()
            .map_err(|_| PathError::InvalidUnicode(path.to_string_lossy().into_owned()))?;
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // Relies on AbsoluteSystemPath being repr(transparent) over Utf8Path,
        // the same way Path relies on being an OsStr.
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn components(&self) -> Utf8Components<'_> {
        self.0.components()
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &AbsoluteSystemPath> {
        self.0.ancestors().map(Self::new_unchecked)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    // Intended for joining literals or obviously single-token strings.
    pub fn join_component(&self, segment: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf(clean(&self.0.join(segment)))
    }

    // Intended for joining a path composed of literals.
    pub fn join_components(&self, segments: &[&str]) -> AbsoluteSystemPathBuf {
        debug_assert!(!segments
            .iter()
            .any(|segment| segment.contains(std::path::MAIN_SEPARATOR)));
        AbsoluteSystemPathBuf(clean(
            &self
                .0
                .join(segments.join(std::path::MAIN_SEPARATOR_STR)),
        ))
    }

    pub fn join_unix_path(&self, unix_path: impl AsRef<RelativeUnixPath>) -> AbsoluteSystemPathBuf {
        let tail = to_system_separators(unix_path.as_ref().as_str());
        AbsoluteSystemPathBuf(clean(&self.0.join(tail)))
    }

    /// Resolves an anchored path against this path as the anchor.
    pub fn resolve(&self, path: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf(self.0.join(path.as_path()))
    }

    /// Produces the anchored form of `path` relative to `self`.
    /// Errors if `path` is not underneath `self`.
    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        AnchoredSystemPathBuf::strip_root(self, path)
    }

    /// Lexical containment check: is `other` underneath `self` once both
    /// sides are cleaned? Does not touch the filesystem.
    pub fn contains(&self, other: &AbsoluteSystemPath) -> bool {
        matches!(self.relation_to_path(other), PathRelation::Parent)
    }

    pub fn relation_to_path(&self, other: &AbsoluteSystemPath) -> PathRelation {
        let these = clean(&self.0);
        let others = clean(&other.0);
        let mut these = these.components();
        let mut others = others.components();
        loop {
            match (these.next(), others.next()) {
                (None, _) => return PathRelation::Parent,
                (_, None) => return PathRelation::Child,
                (Some(a), Some(b)) if a != b => return PathRelation::Divergent,
                (Some(_), Some(_)) => continue,
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn try_exists(&self) -> Result<bool, PathError> {
        self.0
            .as_std_path()
            .try_exists()
            .map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn open(&self) -> Result<File, PathError> {
        File::open(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn create(&self) -> Result<File, PathError> {
        File::create(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn open_with_options(&self, options: &OpenOptions) -> Result<File, PathError> {
        options
            .open(&self.0)
            .map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn read(&self) -> Result<Vec<u8>, PathError> {
        fs::read(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn read_to_string(&self) -> Result<String, PathError> {
        fs::read_to_string(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn create_with_contents<B: AsRef<[u8]>>(&self, contents: B) -> Result<(), PathError> {
        fs::write(&self.0, contents).map_err(|e| PathError::from_io(&self.0, e))
    }

    /// Creates the parent directories of this path.
    pub fn ensure_dir(&self) -> Result<(), PathError> {
        if let Some(parent) = self.0.parent() {
            fs::create_dir_all(parent).map_err(|e| PathError::from_io(parent, e))
        } else {
            Ok(())
        }
    }

    pub fn create_dir_all(&self) -> Result<(), PathError> {
        fs::create_dir_all(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn remove_file(&self) -> Result<(), PathError> {
        fs::remove_file(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn remove_dir_all(&self) -> Result<(), PathError> {
        fs::remove_dir_all(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn symlink_to_file<P: AsRef<str>>(&self, to: P) -> Result<(), PathError> {
        let target = to_system_separators(to.as_ref());
        symlink_file(target, &self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn symlink_to_dir<P: AsRef<str>>(&self, to: P) -> Result<(), PathError> {
        let target = to_system_separators(to.as_ref());
        symlink_dir(target, &self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    pub fn read_link(&self) -> Result<Utf8PathBuf, PathError> {
        let target = fs::read_link(&self.0).map_err(|e| PathError::from_io(&self.0, e))?;
        Utf8PathBuf::try_from(target).map_err(Into::into)
    }

    // Note that this is *not* lstat: symlinks are followed.
    pub fn stat(&self) -> Result<Metadata, PathError> {
        fs::metadata(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    // The equivalent of lstat: metadata for the link itself.
    pub fn symlink_metadata(&self) -> Result<Metadata, PathError> {
        fs::symlink_metadata(&self.0).map_err(|e| PathError::from_io(&self.0, e))
    }

    #[cfg(unix)]
    pub fn set_unix_mode(&self, mode: u32) -> Result<(), PathError> {
        let permissions = fs::Permissions::from_mode(mode);
        fs::set_permissions(&self.0, permissions).map_err(|e| PathError::from_io(&self.0, e))
    }

    #[cfg(not(unix))]
    pub fn set_unix_mode(&self, _mode: u32) -> Result<(), PathError> {
        Ok(())
    }

    /// Collapses `..` and `.` components without following symlinks.
    pub fn clean(&self) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf(clean(&self.0))
    }

    /// Walks up from this path looking for `file_name`, returning the first
    /// directory that contains it.
    pub fn ancestor_containing(&self, file_name: &str) -> Option<&AbsoluteSystemPath> {
        self.ancestors()
            .find(|dir| dir.join_component(file_name).exists())
    }

    /// Whether the final component begins with `.`.
    pub fn is_dotfile(&self) -> bool {
        self.0
            .components()
            .next_back()
            .map_or(false, |c| matches!(c, Utf8Component::Normal(name) if name.starts_with('.')))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn abs(path: &str) -> String {
        if cfg!(windows) {
            format!("C:\\{}", path.replace('/', "\\"))
        } else {
            format!("/{path}")
        }
    }

    #[test]
    fn test_validation() {
        assert!(AbsoluteSystemPath::new(&abs("foo/bar")).is_ok());
        assert!(AbsoluteSystemPath::new("foo/bar").is_err());
    }

    #[test]
    fn test_join_component_cleans() {
        let root = AbsoluteSystemPathBuf::new(abs("some/repo")).unwrap();
        let joined = root.join_component("child");
        assert_eq!(joined.as_str(), abs("some/repo/child"));
    }

    #[test_case("some/repo", "some/repo/child", PathRelation::Parent ; "direct child")]
    #[test_case("some/repo", "some/repo/a/b/c", PathRelation::Parent ; "deep child")]
    #[test_case("some/repo/a", "some/repo", PathRelation::Child ; "inverted")]
    #[test_case("some/repo/a", "some/other", PathRelation::Divergent ; "unrelated")]
    fn test_relation(base: &str, other: &str, expected: PathRelation) {
        let base = AbsoluteSystemPathBuf::new(abs(base)).unwrap();
        let other = AbsoluteSystemPathBuf::new(abs(other)).unwrap();
        assert_eq!(base.relation_to_path(&other), expected);
    }

    #[test]
    fn test_anchor_and_resolve_round_trip() {
        let root = AbsoluteSystemPathBuf::new(abs("some/repo")).unwrap();
        let file = root.join_components(&["packages", "ui", "package.json"]);
        let anchored = root.anchor(&file).unwrap();
        assert_eq!(root.resolve(&anchored), file);
    }

    #[test]
    fn test_anchor_rejects_outside_paths() {
        let root = AbsoluteSystemPathBuf::new(abs("some/repo")).unwrap();
        let outside = AbsoluteSystemPathBuf::new(abs("other")).unwrap();
        assert!(root.anchor(&outside).is_err());
    }
}
