use std::{borrow::Borrow, fmt, ops::Deref, path::Path};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::{AbsoluteSystemPath, AnchoredSystemPath, PathError};

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchoredSystemPathBuf(pub(crate) Utf8PathBuf);

impl AnchoredSystemPathBuf {
    /// Strips `root` from `path`, producing the anchored remainder.
    pub fn strip_root(
        root: &AbsoluteSystemPath,
        path: &AbsoluteSystemPath,
    ) -> Result<Self, PathError> {
        let stripped = path
            .as_path()
            .strip_prefix(root.as_path())
            .map_err(|_| PathError::NotParent(root.to_string(), path.to_string()))?;
        Ok(AnchoredSystemPathBuf(stripped.to_owned()))
    }

    pub fn from_raw(raw: impl AsRef<str>) -> Result<Self, PathError> {
        AnchoredSystemPath::new(raw.as_ref()).map(ToOwned::to_owned)
    }

    pub(crate) fn new_unchecked(path: impl Into<Utf8PathBuf>) -> Self {
        AnchoredSystemPathBuf(path.into())
    }

    pub fn as_anchored_path(&self) -> &AnchoredSystemPath {
        AnchoredSystemPath::new_unchecked(&self.0)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn push(&mut self, segment: &str) {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        self.0.push(segment);
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_anchored_path()
    }
}

impl Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self.as_anchored_path()
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self.as_anchored_path()
    }
}

impl AsRef<Path> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AbsoluteSystemPathBuf;

    fn abs(path: &str) -> AbsoluteSystemPathBuf {
        let raw = if cfg!(windows) {
            format!("C:\\{}", path.replace('/', "\\"))
        } else {
            format!("/{path}")
        };
        AbsoluteSystemPathBuf::new(raw).unwrap()
    }

    #[test]
    fn test_strip_root() {
        let root = abs("some/repo");
        let inner = abs("some/repo/packages/ui");
        let anchored = AnchoredSystemPathBuf::strip_root(&root, &inner).unwrap();
        assert_eq!(anchored.to_unix().as_str(), "packages/ui");

        let outside = abs("some/other");
        assert!(AnchoredSystemPathBuf::strip_root(&root, &outside).is_err());
    }
}
