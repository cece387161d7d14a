//! The local filesystem tier.
//!
//! Artifacts live at `<cache-dir>/<fingerprint>.tar.gz` with an adjacent
//! `<fingerprint>-meta.json` sidecar carrying the metadata that does not
//! belong in the archive itself.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheSource,
};

pub struct FsCache {
    cache_directory: AbsoluteSystemPathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?).map_err(CacheError::InvalidMetadata)
    }
}

impl FsCache {
    pub fn new(
        cache_dir: &Utf8Path,
        repo_root: &AbsoluteSystemPath,
    ) -> Result<Self, CacheError> {
        let cache_directory = AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir.to_string());
        cache_directory.create_dir_all()?;
        Ok(FsCache { cache_directory })
    }

    fn artifact_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory.join_component(&format!("{hash}.tar.gz"))
    }

    fn metadata_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory
            .join_component(&format!("{hash}-meta.json"))
    }

    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let archive_path = self.artifact_path(hash);
        if !archive_path.exists() {
            debug!("local cache miss for {hash}");
            return Ok(None);
        }

        let restored_files = CacheReader::open(&archive_path)?.restore(anchor)?;
        let metadata = CacheMetadata::read(&self.metadata_path(hash))?;

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: metadata.duration,
            },
            restored_files,
        )))
    }

    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if !self.artifact_path(hash).exists() {
            return Ok(None);
        }
        // A missing sidecar means a partially-written entry; report a miss
        // rather than a hit with made-up savings.
        let duration = CacheMetadata::read(&self.metadata_path(hash))
            .map(|metadata| metadata.duration)
            .unwrap_or(0);
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: duration,
        }))
    }

    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let archive_path = self.artifact_path(hash);
        let mut writer = CacheWriter::create(&archive_path)?;
        writer.put_files(anchor, files)?;
        writer.finish()?;

        let metadata = CacheMetadata {
            hash: hash.to_string(),
            duration,
        };
        let body =
            serde_json::to_string(&metadata).map_err(CacheError::MetadataWriteFailure)?;
        self.metadata_path(hash).create_with_contents(body)?;
        Ok(())
    }
}
