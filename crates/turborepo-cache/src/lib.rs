#![deny(clippy::all)]
//! The two-tier task cache: a local filesystem tier and an optional remote
//! HTTP tier behind a priority-ordered multiplexer, with a deterministic
//! gzip tar codec for artifacts.

/// A front for the multiplexer that queues writes onto a bounded worker
/// pool so task execution never waits on uploads.
mod async_cache;
/// Artifact creation and restoration.
pub mod cache_archive;
/// The local filesystem tier.
pub mod fs;
/// The remote HTTP tier.
pub mod http;
/// The priority-ordered tier list.
pub mod multiplexer;

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
pub use multiplexer::CacheMultiplexer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid file path: {0}")]
    Path(#[from] turbopath::PathError),
    #[error("cannot untar file to {0}")]
    InvalidFilePath(String),
    #[error("links in the cache are cyclic")]
    CycleDetected,
    #[error("invalid tar, link target missing from header")]
    LinkTargetNotOnHeader,
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType),
    #[error("attempted to cache unsupported file type")]
    CreateUnsupportedFileType,
    #[error("invalid cache metadata file: {0}")]
    InvalidMetadata(serde_json::Error),
    #[error("failed to write cache metadata file: {0}")]
    MetadataWriteFailure(serde_json::Error),
    #[error("cache artifact is missing an index entry")]
    MissingIndex,
    #[error("remote caching is disabled: {0}")]
    CacheDisabled(String),
    #[error("failed to contact remote cache: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote cache returned {status}: {message}")]
    Response { status: u16, message: String },
    #[error("unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

impl CacheError {
    /// A disabled tier is removed from the multiplexer; the run continues.
    pub fn is_cache_disabled(&self) -> bool {
        matches!(self, CacheError::CacheDisabled(_))
    }

    /// Transient remote failures are logged and treated as misses; they
    /// never fail the run.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            CacheError::Response { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    /// Previously-observed task duration in milliseconds; restored from the
    /// artifact metadata so time-saved reporting survives cache transport.
    pub time_saved: u64,
}

#[derive(Clone, Debug, Default)]
pub struct CacheOpts {
    /// Cache directory, resolved against the repo root when relative.
    pub cache_dir: Utf8PathBuf,
    pub skip_filesystem: bool,
    pub skip_remote: bool,
    pub remote_cache_read_only: bool,
    /// Upper bound on concurrent async cache writes.
    pub workers: u32,
    pub remote_cache_opts: Option<RemoteCacheOpts>,
}

impl CacheOpts {
    pub fn default_cache_dir() -> Utf8PathBuf {
        Utf8PathBuf::from("node_modules/.cache/turbo")
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCacheOpts {
    pub api_url: String,
    pub token: String,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
    pub timeout_secs: u64,
}
