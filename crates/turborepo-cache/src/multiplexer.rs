//! The priority-ordered cache tier list.
//!
//! Fetches walk tiers in order and fill the faster tiers that missed once
//! a slower one hits. Puts go to every tier concurrently. A tier that
//! reports caching disabled is dropped from the list for the rest of the
//! run; removal is serialized behind a write lock and idempotent.

use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::{
    fs::FsCache, http::HttpCache, CacheError, CacheHitMetadata, CacheOpts,
};

/// One cache implementation in the priority list. A fixed, known set, so a
/// sum type rather than dynamic dispatch.
pub enum CacheTier {
    Fs(FsCache),
    Http(HttpCache),
}

impl CacheTier {
    fn name(&self) -> &'static str {
        match self {
            CacheTier::Fs(_) => "fs",
            CacheTier::Http(_) => "http",
        }
    }

    async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        match self {
            CacheTier::Fs(fs) => fs.fetch(anchor, key),
            CacheTier::Http(http) => http.fetch(anchor, key).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        match self {
            CacheTier::Fs(fs) => fs.exists(key),
            CacheTier::Http(http) => http.exists(key).await,
        }
    }

    async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        match self {
            CacheTier::Fs(fs) => fs.put(anchor, key, files, duration),
            CacheTier::Http(http) => http.put(anchor, key, files, duration).await,
        }
    }
}

type RemovalHandler = Box<dyn Fn(&str) + Send + Sync>;

pub struct CacheMultiplexer {
    tiers: RwLock<Vec<Arc<CacheTier>>>,
    on_tier_removed: Option<RemovalHandler>,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        on_tier_removed: Option<RemovalHandler>,
    ) -> Result<Self, CacheError> {
        let mut tiers = Vec::new();
        if !opts.skip_filesystem {
            let cache_dir = if opts.cache_dir.as_str().is_empty() {
                CacheOpts::default_cache_dir()
            } else {
                opts.cache_dir.clone()
            };
            tiers.push(Arc::new(CacheTier::Fs(FsCache::new(&cache_dir, repo_root)?)));
        }
        if !opts.skip_remote {
            if let Some(remote_opts) = &opts.remote_cache_opts {
                tiers.push(Arc::new(CacheTier::Http(HttpCache::new(remote_opts)?)));
            }
        }
        // Possible to configure yourself out of having any cache at all;
        // worth mentioning, not worth failing the build over.
        if tiers.is_empty() {
            warn!("no caches are enabled");
        }

        Ok(CacheMultiplexer {
            tiers: RwLock::new(tiers),
            on_tier_removed,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_tiers(
        tiers: Vec<CacheTier>,
        on_tier_removed: Option<RemovalHandler>,
    ) -> Self {
        CacheMultiplexer {
            tiers: RwLock::new(tiers.into_iter().map(Arc::new).collect()),
            on_tier_removed,
        }
    }

    fn snapshot(&self) -> Vec<Arc<CacheTier>> {
        self.tiers.read().expect("tier lock poisoned").clone()
    }

    /// Removing a tier that is already gone is a no-op; the removal
    /// callback fires only on an actual removal.
    fn remove_tier(&self, name: &str) {
        let mut tiers = self.tiers.write().expect("tier lock poisoned");
        let before = tiers.len();
        tiers.retain(|tier| tier.name() != name);
        if tiers.len() < before {
            warn!("removing {name} cache tier for the remainder of the run");
            if let Some(handler) = &self.on_tier_removed {
                handler(name);
            }
        }
    }

    /// Walks tiers in priority order. On the first hit, all
    /// higher-priority tiers that were walked past are filled with the
    /// artifact before the hit is returned.
    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let tiers = self.snapshot();
        for (priority, tier) in tiers.iter().enumerate() {
            match tier.fetch(anchor, key).await {
                Ok(Some((metadata, files))) => {
                    self.fill(&tiers[..priority], anchor, key, &files, metadata.time_saved)
                        .await;
                    return Ok(Some((metadata, files)));
                }
                Ok(None) => continue,
                Err(e) if e.is_cache_disabled() => {
                    self.remove_tier(tier.name());
                }
                Err(e) => {
                    debug!("failed to fetch from {} cache: {e}", tier.name());
                }
            }
        }
        Ok(None)
    }

    async fn fill(
        &self,
        tiers: &[Arc<CacheTier>],
        anchor: &AbsoluteSystemPath,
        key: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) {
        for tier in tiers {
            if let Err(e) = tier.put(anchor, key, files, duration).await {
                if e.is_cache_disabled() {
                    self.remove_tier(tier.name());
                } else {
                    debug!("failed to fill {} cache: {e}", tier.name());
                }
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let tiers = self.snapshot();
        for tier in tiers {
            match tier.exists(key).await {
                Ok(Some(metadata)) => return Ok(Some(metadata)),
                Ok(None) => continue,
                Err(e) if e.is_cache_disabled() => self.remove_tier(tier.name()),
                Err(e) => debug!("failed to probe {} cache: {e}", tier.name()),
            }
        }
        Ok(None)
    }

    /// Writes to every tier concurrently. All writes complete before this
    /// returns; a disabled tier is removed, any other error propagates
    /// after the remaining writes have finished.
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let tiers = self.snapshot();
        let writes = tiers.iter().map(|tier| {
            let tier = tier.clone();
            async move {
                let result = tier.put(anchor, key, files, duration).await;
                (tier.name(), result)
            }
        });

        let mut first_error = None;
        for (name, result) in join_all(writes).await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_cache_disabled() => self.remove_tier(name),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8Path;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    fn anchored(path: &str) -> AnchoredSystemPathBuf {
        turbopath::RelativeUnixPathBuf::new(path)
            .unwrap()
            .to_anchored_system_path_buf()
    }

    fn fs_tier(dir: &tempfile::TempDir) -> (CacheTier, AbsoluteSystemPathBuf) {
        let root =
            AbsoluteSystemPathBuf::from_std_path(&dir.path().canonicalize().unwrap()).unwrap();
        let cache = FsCache::new(Utf8Path::new("cache"), &root).unwrap();
        (CacheTier::Fs(cache), root)
    }

    #[tokio::test]
    async fn test_put_writes_all_tiers_and_fetch_prefers_the_first() {
        let first_dir = tempfile::tempdir().unwrap();
        let second_dir = tempfile::tempdir().unwrap();
        let (first, _) = fs_tier(&first_dir);
        let (second, _) = fs_tier(&second_dir);
        let multiplexer = CacheMultiplexer::from_tiers(vec![first, second], None);

        let repo = tempfile::tempdir().unwrap();
        let repo_root =
            AbsoluteSystemPathBuf::from_std_path(&repo.path().canonicalize().unwrap()).unwrap();
        repo_root
            .join_component("out.txt")
            .create_with_contents("output")
            .unwrap();

        let files = vec![anchored("out.txt")];
        multiplexer
            .put(&repo_root, "cafe", &files, 42)
            .await
            .unwrap();

        // Both tiers independently report the artifact.
        for dir in [&first_dir, &second_dir] {
            let (tier, _) = fs_tier(dir);
            assert!(tier.exists("cafe").await.unwrap().is_some());
        }

        let restore = tempfile::tempdir().unwrap();
        let restore_root =
            AbsoluteSystemPathBuf::from_std_path(&restore.path().canonicalize().unwrap()).unwrap();
        let hit = multiplexer.fetch(&restore_root, "cafe").await.unwrap();
        assert_eq!(hit.unwrap().0.time_saved, 42);
    }

    #[tokio::test]
    async fn test_lower_tier_hit_fills_higher_tiers() {
        let first_dir = tempfile::tempdir().unwrap();
        let second_dir = tempfile::tempdir().unwrap();
        let (first, _) = fs_tier(&first_dir);
        let (second, _) = fs_tier(&second_dir);

        let repo = tempfile::tempdir().unwrap();
        let repo_root =
            AbsoluteSystemPathBuf::from_std_path(&repo.path().canonicalize().unwrap()).unwrap();
        repo_root
            .join_component("out.txt")
            .create_with_contents("output")
            .unwrap();
        let files = vec![anchored("out.txt")];

        // Seed only the second (lower-priority) tier.
        let (seed, _) = fs_tier(&second_dir);
        if let CacheTier::Fs(fs) = &seed {
            fs.put(&repo_root, "cafe", &files, 7).unwrap();
        }

        let multiplexer = CacheMultiplexer::from_tiers(vec![first, second], None);
        let restore = tempfile::tempdir().unwrap();
        let restore_root =
            AbsoluteSystemPathBuf::from_std_path(&restore.path().canonicalize().unwrap()).unwrap();
        let hit = multiplexer.fetch(&restore_root, "cafe").await.unwrap();
        assert!(hit.is_some());

        // The first tier has been filled by the read-through.
        let (first_again, _) = fs_tier(&first_dir);
        assert!(first_again.exists("cafe").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tier_removal_is_idempotent_and_observable() {
        let dir = tempfile::tempdir().unwrap();
        let (tier, _) = fs_tier(&dir);
        let removals = Arc::new(AtomicUsize::new(0));
        let counter = removals.clone();
        let multiplexer = CacheMultiplexer::from_tiers(
            vec![tier],
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        multiplexer.remove_tier("fs");
        multiplexer.remove_tier("fs");
        assert_eq!(removals.load(Ordering::SeqCst), 1);

        // With zero tiers, fetch is a miss and put is a no-op.
        let repo = tempfile::tempdir().unwrap();
        let repo_root =
            AbsoluteSystemPathBuf::from_std_path(&repo.path().canonicalize().unwrap()).unwrap();
        assert!(multiplexer
            .fetch(&repo_root, "cafe")
            .await
            .unwrap()
            .is_none());
        multiplexer.put(&repo_root, "cafe", &[], 0).await.unwrap();
    }
}
