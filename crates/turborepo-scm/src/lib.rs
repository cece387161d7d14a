#![deny(clippy::all)]
//! Source-control bridge.
//!
//! Provides two services to the rest of the runner: enumerating changed
//! files between two refs (for affected-set computation), and hashing the
//! files of a package (for fingerprinting). When git or a repository is
//! unavailable every operation degrades to a filesystem walk, so hashing
//! always succeeds; change detection instead reports a recoverable error
//! that callers downgrade to "all files changed".

mod git;
mod hash_object;
mod ls_tree;
mod manual;
mod package_deps;
mod status;

use std::{collections::HashMap, process::Command};

use thiserror::Error;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, PathError, RelativeUnixPathBuf};

/// Sorted mapping of repo-relative unix path to 160-bit content hash. The
/// hash scheme matches git object ids so SCM-provided hashes and locally
/// computed ones can be mixed freely.
pub type GitHashes = HashMap<RelativeUnixPathBuf, String>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("git error: {0}")]
    Git(String),
    #[error(
        "unable to resolve ref: {0}. Falling back to considering all files changed requires a \
         full git history"
    )]
    UnableToResolveRef(String),
    #[error("git binary not found: {0}")]
    GitBinaryNotFound(#[from] which::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("could not parse git output: {0}")]
    Parse(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("error walking files: {0}")]
    Walk(#[from] globwalk::WalkError),
    #[error("error reading file for hashing: {0}")]
    Ignore(#[from] ignore::Error),
}

impl Error {
    /// Recoverable errors mean "we could not determine a git range";
    /// callers respond by treating every file as changed and warning once.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::UnableToResolveRef(_))
    }

    pub(crate) fn git_error(s: impl Into<String>) -> Self {
        Error::Git(s.into())
    }
}

#[derive(Debug, Clone)]
pub struct Git {
    root: AbsoluteSystemPathBuf,
    bin: AbsoluteSystemPathBuf,
}

impl Git {
    fn find(path_in_repo: &AbsoluteSystemPath) -> Result<Self, GitError> {
        let root = find_git_root(path_in_repo)?;
        let bin = which::which("git")
            .map_err(Error::GitBinaryNotFound)
            .and_then(|bin| AbsoluteSystemPathBuf::from_std_path(&bin).map_err(Error::Path))
            .map_err(GitError::Root)?;
        Ok(Self { root, bin })
    }

    /// Runs git in the repo root, capturing stdout. Non-zero exit becomes
    /// an error carrying stderr.
    pub(crate) fn run(&self, args: &[impl AsRef<std::ffi::OsStr>]) -> Result<Vec<u8>, Error> {
        let output = Command::new(self.bin.as_std_path())
            .args(args)
            .current_dir(self.root.as_std_path())
            .output()?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(Error::git_error(format!(
                "git exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[derive(Debug, Error)]
enum GitError {
    #[error("repository not found")]
    NotARepo,
    #[error(transparent)]
    Root(Error),
}

fn find_git_root(turbo_root: &AbsoluteSystemPath) -> Result<AbsoluteSystemPathBuf, GitError> {
    turbo_root
        .ancestors()
        .find(|dir| dir.join_component(".git").exists())
        .map(|p| p.to_owned())
        .ok_or(GitError::NotARepo)
}

/// The resolved source-control backend for a repository.
#[derive(Debug, Clone)]
pub enum SCM {
    Git(Git),
    Manual,
}

impl SCM {
    /// Never fails: missing git or a missing repository produce the manual
    /// fallback backend.
    pub fn new(path_in_repo: &AbsoluteSystemPath) -> SCM {
        match Git::find(path_in_repo) {
            Ok(git) => SCM::Git(git),
            Err(e) => {
                tracing::debug!("{}, using manual file hashing", e);
                SCM::Manual
            }
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, SCM::Manual)
    }
}
