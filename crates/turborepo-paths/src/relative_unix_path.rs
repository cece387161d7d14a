use std::fmt;

use camino::Utf8Path;

use crate::{to_system_separators, AnchoredSystemPathBuf, PathError, RelativeUnixPathBuf};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RelativeUnixPath(pub(crate) str);

impl ToOwned for RelativeUnixPath {
    type Owned = RelativeUnixPathBuf;

    fn to_owned(&self) -> Self::Owned {
        RelativeUnixPathBuf(self.0.to_owned())
    }
}

impl AsRef<RelativeUnixPath> for RelativeUnixPath {
    fn as_ref(&self) -> &RelativeUnixPath {
        self
    }
}

impl fmt::Display for RelativeUnixPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl RelativeUnixPath {
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = value.as_ref();
        if path.starts_with('/') {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &str) -> &Self {
        unsafe { &*(path as *const str as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_anchored_system_path_buf(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::new_unchecked(to_system_separators(&self.0))
    }

    pub fn parent(&self) -> Option<&RelativeUnixPath> {
        Utf8Path::new(&self.0)
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .map(|p| Self::new_unchecked(p.as_str()))
    }

    pub fn file_name(&self) -> Option<&str> {
        Utf8Path::new(&self.0).file_name()
    }

    pub fn strip_prefix(
        &self,
        prefix: &RelativeUnixPath,
    ) -> Result<&RelativeUnixPath, PathError> {
        if prefix.0.is_empty() {
            return Ok(self);
        }
        let remainder = self
            .0
            .strip_prefix(&prefix.0)
            .and_then(|tail| tail.strip_prefix('/').or(Some(tail).filter(|t| t.is_empty())))
            .ok_or_else(|| PathError::NotParent(prefix.0.to_string(), self.0.to_string()))?;
        Ok(Self::new_unchecked(remainder))
    }

    pub fn join(&self, tail: &RelativeUnixPath) -> RelativeUnixPathBuf {
        if self.0.is_empty() {
            return tail.to_owned();
        }
        RelativeUnixPathBuf(format!("{}/{}", &self.0, &tail.0))
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }
}
