#![deny(clippy::all)]
//! Typed paths for the task runner.
//!
//! Four families of paths exist, and every piece of file I/O in the
//! workspace goes through one of them:
//! - `AbsoluteSystemPath(Buf)`: absolute paths in the current system's
//!   format.
//! - `AnchoredSystemPath(Buf)`: paths relative to a fixed root (almost
//!   always the repo root), system format.
//! - `RelativeUnixPath(Buf)`: relative paths with `/` separators, used for
//!   hashing, lockfiles, and archive entry names where output must not
//!   depend on the host OS.
//!
//! All paths are UTF-8. Paths that fail UTF-8 validation are rejected at
//! the boundary instead of surfacing as surprises deep in hashing code.

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod anchored_system_path_buf;
mod relative_unix_path;
mod relative_unix_path_buf;

use std::io;

pub use absolute_system_path::{AbsoluteSystemPath, PathRelation};
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::AnchoredSystemPath;
pub use anchored_system_path_buf::AnchoredSystemPathBuf;
use camino::{Utf8Path, Utf8PathBuf};
use path_clean::PathClean;
pub use relative_unix_path::RelativeUnixPath;
pub use relative_unix_path_buf::RelativeUnixPathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path {0} is not a prefix of {1}")]
    NotParent(String, String),
    #[error("path is malformed: {0}")]
    MalformedPath(String),
    #[error("io error at {path}: {error}")]
    Io { path: String, error: io::Error },
}

impl PathError {
    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        matches!(self, PathError::Io { error, .. } if error.kind() == kind)
    }

    pub(crate) fn from_io(path: impl ToString, error: io::Error) -> Self {
        PathError::Io {
            path: path.to_string(),
            error,
        }
    }
}

impl From<camino::FromPathBufError> for PathError {
    fn from(err: camino::FromPathBufError) -> Self {
        PathError::InvalidUnicode(err.into_path_buf().to_string_lossy().into_owned())
    }
}

/// Lexically normalizes a path: collapses `.`, `..`, and repeated
/// separators without touching the filesystem.
pub(crate) fn clean(path: &Utf8Path) -> Utf8PathBuf {
    let cleaned = path.as_std_path().clean();
    // Cleaning only removes or reorders existing UTF-8 components.
    Utf8PathBuf::from_path_buf(cleaned).expect("cleaning a UTF-8 path preserves UTF-8")
}

/// Converts a system path string to unix separators. Only meaningful on
/// Windows; on unix systems system paths already are unix paths.
pub(crate) fn to_unix_separators(path: &str) -> String {
    if cfg!(windows) {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}

/// Converts a unix path string to system separators.
pub(crate) fn to_system_separators(path: &str) -> String {
    if cfg!(windows) {
        path.replace('/', "\\")
    } else {
        path.to_string()
    }
}
