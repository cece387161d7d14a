use std::{
    borrow::Borrow,
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::{clean, to_system_separators, AbsoluteSystemPath, PathError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbsoluteSystemPathBuf(pub(crate) Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    /// Validates and normalizes an absolute path of unknown provenance:
    /// separators are converted to the system's and the result is cleaned.
    pub fn new(unchecked_path: impl Into<String>) -> Result<Self, PathError> {
        let path: String = unchecked_path.into();
        let system = to_system_separators(&path);
        let path = Utf8PathBuf::from(system);
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(AbsoluteSystemPathBuf(clean(&path)))
    }

    /// Anchors `unknown` at `base` when relative, otherwise validates it as
    /// absolute. The entry point for user-supplied paths (flags, config).
    pub fn from_unknown(base: &AbsoluteSystemPath, unknown: impl Into<String>) -> Self {
        let unknown: String = unknown.into();
        let system = to_system_separators(&unknown);
        let path = Utf8PathBuf::from(system);
        if path.is_absolute() {
            AbsoluteSystemPathBuf(clean(&path))
        } else {
            AbsoluteSystemPathBuf(clean(&base.as_path().join(path)))
        }
    }

    pub fn from_std_path(path: &Path) -> Result<Self, PathError> {
        AbsoluteSystemPath::from_std_path(path).map(ToOwned::to_owned)
    }

    pub fn cwd() -> Result<Self, PathError> {
        let cwd = std::env::current_dir().map_err(|e| PathError::from_io("cwd", e))?;
        Self::from_std_path(&cwd)
    }

    pub fn as_absolute_path(&self) -> &AbsoluteSystemPath {
        AbsoluteSystemPath::new_unchecked(&self.0)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }

    pub fn into_std_path_buf(self) -> PathBuf {
        self.0.into_std_path_buf()
    }

    pub fn push(&mut self, segment: &str) {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        self.0.push(segment);
    }

    pub fn pop(&mut self) -> bool {
        self.0.pop()
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_absolute_path()
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self.as_absolute_path()
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self.as_absolute_path()
    }
}

impl AsRef<Path> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl AsRef<Utf8Path> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &Utf8Path {
        &self.0
    }
}

impl TryFrom<PathBuf> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::from_std_path(&path)
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
