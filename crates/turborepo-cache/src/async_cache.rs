//! Queues cache writes behind a bounded worker pool so task execution
//! continues while artifacts upload. Reads are passed straight through.

use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::JoinSet,
};
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

use crate::{CacheError, CacheHitMetadata, CacheMultiplexer, CacheOpts};

const WARNING_CUTOFF: u8 = 4;

pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    writer_sender: mpsc::Sender<WorkerRequest>,
}

enum WorkerRequest {
    WriteRequest {
        anchor: AbsoluteSystemPathBuf,
        key: String,
        duration: u64,
        files: Vec<AnchoredSystemPathBuf>,
    },
    Flush(oneshot::Sender<()>),
}

impl AsyncCache {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        on_tier_removed: Option<Box<dyn Fn(&str) + Send + Sync>>,
    ) -> Result<AsyncCache, CacheError> {
        let real_cache = Arc::new(CacheMultiplexer::new(opts, repo_root, on_tier_removed)?);
        let max_workers = opts.workers.max(1) as usize;
        let (writer_sender, mut write_consumer) = mpsc::channel(max_workers);

        // The dispatcher owns a semaphore bounding concurrent writes; a
        // flush waits for all spawned writes to settle before acking.
        let cache = real_cache.clone();
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(max_workers));
            let mut workers = JoinSet::new();
            let mut consecutive_failures: u8 = 0;
            while let Some(request) = write_consumer.recv().await {
                match request {
                    WorkerRequest::WriteRequest {
                        anchor,
                        key,
                        duration,
                        files,
                    } => {
                        let permit = semaphore
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("cache write semaphore closed");
                        let cache = cache.clone();
                        workers.spawn(async move {
                            let result = cache.put(&anchor, &key, &files, duration).await;
                            drop(permit);
                            result.is_err()
                        });
                        // Surface slow-burning upload problems without
                        // failing the run.
                        while let Some(finished) = workers.try_join_next() {
                            if finished.unwrap_or(true) {
                                consecutive_failures = consecutive_failures.saturating_add(1);
                            } else {
                                consecutive_failures = 0;
                            }
                        }
                        if consecutive_failures == WARNING_CUTOFF {
                            warn!("multiple consecutive cache uploads have failed");
                            consecutive_failures = 0;
                        }
                    }
                    WorkerRequest::Flush(ack) => {
                        while workers.join_next().await.is_some() {}
                        ack.send(()).ok();
                    }
                }
            }
            while workers.join_next().await.is_some() {}
        });

        Ok(AsyncCache {
            real_cache,
            writer_sender,
        })
    }

    /// Queues an artifact write. Returns once the write is accepted, not
    /// once it completes; `wait` or `shutdown` barriers on completion.
    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        key: String,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        self.writer_sender
            .send(WorkerRequest::WriteRequest {
                anchor,
                key,
                duration,
                files,
            })
            .await
            .map_err(|_| CacheError::CacheShuttingDown)
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        self.real_cache.fetch(anchor, key).await
    }

    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        self.real_cache.exists(key).await
    }

    /// Blocks until every queued write has finished.
    pub async fn wait(&self) -> Result<(), CacheError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer_sender
            .send(WorkerRequest::Flush(ack_tx))
            .await
            .map_err(|_| CacheError::CacheShuttingDown)?;
        ack_rx.await.map_err(|_| CacheError::CacheShuttingDown)
    }

    /// Flushes queued writes and closes the queue.
    pub async fn shutdown(self) -> Result<(), CacheError> {
        self.wait().await
    }
}
