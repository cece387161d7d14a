//! Task-scoped caching: deciding whether a task can restore from cache,
//! capturing its outputs and log, and writing them back on success.

use std::{
    io::{BufWriter, Write},
    sync::Arc,
};

use globwalk::{globwalk, WalkType};
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_cache::{AsyncCache, CacheHitMetadata};
use turborepo_repository::package_graph::PackageInfo;

use crate::{
    cli::OutputLogsMode,
    opts::RunCacheOpts,
    run::task_id::TaskId,
    turbo_json::{TaskDefinition, TaskOutputs},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] turborepo_cache::CacheError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error("cannot find task outputs: {0}")]
    Globwalk(#[from] globwalk::WalkError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink for cache status lines and replayed logs; the visitor supplies an
/// implementation wired to its output machinery.
pub trait CacheOutput {
    fn status(&mut self, message: &str);
    fn error(&mut self, message: &str);
    fn replay_logs(&mut self, log_file: &AbsoluteSystemPath) -> std::io::Result<()>;
}

/// Run-wide caching state shared by every task.
pub struct RunCache {
    cache: AsyncCache,
    reads_disabled: bool,
    writes_disabled: bool,
    repo_root: AbsoluteSystemPathBuf,
    task_output_logs_override: Option<OutputLogsMode>,
}

impl RunCache {
    pub fn new(
        cache: AsyncCache,
        repo_root: &AbsoluteSystemPath,
        opts: &RunCacheOpts,
    ) -> Self {
        RunCache {
            cache,
            reads_disabled: opts.skip_reads,
            writes_disabled: opts.skip_writes,
            repo_root: repo_root.to_owned(),
            task_output_logs_override: opts.task_output_logs_override,
        }
    }

    pub fn task_cache(
        self: &Arc<Self>,
        task_definition: Arc<TaskDefinition>,
        workspace_info: &PackageInfo,
        task_id: TaskId<'static>,
        hash: &str,
    ) -> TaskCache {
        let package_dir = workspace_info.package_path().to_unix();
        let log_file_path = self
            .repo_root
            .join_unix_path(
                &package_dir
                    .join(&TaskDefinition::workspace_relative_log_file(task_id.task())),
            );

        // Output globs are written relative to the package; caching works
        // on repo-relative paths.
        let mut repo_relative_globs = TaskOutputs::default();
        for glob in &task_definition.outputs.inclusions {
            repo_relative_globs
                .inclusions
                .push(join_glob(package_dir.as_str(), glob));
        }
        for glob in &task_definition.outputs.exclusions {
            repo_relative_globs
                .exclusions
                .push(join_glob(package_dir.as_str(), glob));
        }

        let task_output_logs = self
            .task_output_logs_override
            .unwrap_or(task_definition.output_mode);

        TaskCache {
            caching_disabled: !task_definition.cache,
            run_cache: self.clone(),
            repo_relative_globs,
            hash: hash.to_string(),
            expanded_outputs: Vec::new(),
            task_output_logs,
            task_id,
            log_file_path,
        }
    }

    /// Flushes pending cache writes; called once at the end of the run.
    pub async fn shutdown_cache(&self) {
        if let Err(e) = self.cache.wait().await {
            warn!("failed to flush cache writes: {e}");
        }
    }
}

fn join_glob(base: &str, glob: &str) -> String {
    if base.is_empty() {
        glob.to_string()
    } else {
        format!("{base}/{glob}")
    }
}

/// One task's view of the cache.
pub struct TaskCache {
    run_cache: Arc<RunCache>,
    repo_relative_globs: TaskOutputs,
    hash: String,
    expanded_outputs: Vec<AnchoredSystemPathBuf>,
    caching_disabled: bool,
    task_output_logs: OutputLogsMode,
    task_id: TaskId<'static>,
    log_file_path: AbsoluteSystemPathBuf,
}

impl TaskCache {
    pub fn is_caching_disabled(&self) -> bool {
        self.caching_disabled
    }

    pub fn output_logs(&self) -> OutputLogsMode {
        self.task_output_logs
    }

    pub fn expanded_outputs(&self) -> &[AnchoredSystemPathBuf] {
        &self.expanded_outputs
    }

    pub fn log_file_path(&self) -> &AbsoluteSystemPath {
        &self.log_file_path
    }

    /// Probes for an artifact without restoring; used by dry runs.
    pub async fn exists(&self) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            return Ok(None);
        }
        Ok(self.run_cache.cache.exists(&self.hash).await?)
    }

    /// Attempts a cache restore. `Ok(None)` is a miss.
    pub async fn restore_outputs(
        &mut self,
        output: &mut impl CacheOutput,
    ) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                output.status(&format!(
                    "cache bypass, force executing {}",
                    self.hash
                ));
            }
            return Ok(None);
        }

        let cache_status = self
            .run_cache
            .cache
            .fetch(&self.run_cache.repo_root, &self.hash)
            .await?;

        let Some((cache_hit_metadata, restored_files)) = cache_status else {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                output.status(&format!("cache miss, executing {}", self.hash));
            }
            return Ok(None);
        };

        self.expanded_outputs = restored_files;

        match self.task_output_logs {
            OutputLogsMode::Full => {
                output.status(&format!("cache hit, replaying logs {}", self.hash));
                self.replay_log_file(output);
            }
            OutputLogsMode::HashOnly => {
                output.status(&format!("cache hit, suppressing logs {}", self.hash));
            }
            OutputLogsMode::NewOnly | OutputLogsMode::ErrorsOnly | OutputLogsMode::None => {}
        }

        Ok(Some(cache_hit_metadata))
    }

    pub fn replay_log_file(&self, output: &mut impl CacheOutput) {
        if self.log_file_path.exists() {
            if let Err(e) = output.replay_logs(&self.log_file_path) {
                warn!("error replaying logs: {e}");
            }
        }
    }

    /// Failure path: surface logs for modes that suppress them on success.
    pub fn on_error(&self, output: &mut impl CacheOutput) {
        if self.task_output_logs == OutputLogsMode::ErrorsOnly {
            output.status(&format!("cache miss, executing {}", self.hash));
            self.replay_log_file(output);
        }
    }

    /// A writer that captures the task's output into its log file while
    /// passing it through to `sink`.
    pub fn output_writer<W: Write>(&self, sink: W) -> Result<LogWriter<W>, Error> {
        let mut log_writer = LogWriter {
            log_file: None,
            sink: None,
        };

        if !self.caching_disabled && !self.run_cache.writes_disabled {
            self.log_file_path.ensure_dir()?;
            let log_file = self.log_file_path.create()?;
            log_writer.log_file = Some(BufWriter::new(log_file));
        }
        if !matches!(
            self.task_output_logs,
            OutputLogsMode::None | OutputLogsMode::HashOnly | OutputLogsMode::ErrorsOnly
        ) {
            log_writer.sink = Some(sink);
        }

        Ok(log_writer)
    }

    /// Collects the output files and queues the artifact write.
    pub async fn save_outputs(&mut self, duration_ms: u64) -> Result<(), Error> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }

        debug!("caching outputs: outputs: {:?}", self.repo_relative_globs);

        let mut files: Vec<AnchoredSystemPathBuf> = Vec::new();
        if !self.repo_relative_globs.inclusions.is_empty() {
            let found = globwalk(
                &self.run_cache.repo_root,
                &self.repo_relative_globs.inclusions,
                &self.repo_relative_globs.exclusions,
                WalkType::All,
            )?;
            for file in found {
                files.push(self.run_cache.repo_root.anchor(&file)?);
            }
        }
        // The log file is always part of the artifact.
        if self.log_file_path.exists() {
            files.push(self.run_cache.repo_root.anchor(&self.log_file_path)?);
        }
        files.sort();

        self.run_cache
            .cache
            .put(
                self.run_cache.repo_root.clone(),
                self.hash.clone(),
                files.clone(),
                duration_ms,
            )
            .await?;
        self.expanded_outputs = files;

        Ok(())
    }
}

/// Tees task output into the log file and the live sink.
pub struct LogWriter<W: Write> {
    log_file: Option<BufWriter<std::fs::File>>,
    sink: Option<W>,
}

impl<W: Write> Write for LogWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(log_file) = &mut self.log_file {
            log_file.write_all(buf)?;
        }
        if let Some(sink) = &mut self.sink {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(log_file) = &mut self.log_file {
            log_file.flush()?;
        }
        if let Some(sink) = &mut self.sink {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Copies a captured log file into a writer, e.g. to replay a cache hit.
pub fn replay_logs(
    mut writer: impl Write,
    log_file: &AbsoluteSystemPath,
) -> std::io::Result<()> {
    let contents = log_file
        .read()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    writer.write_all(&contents)
}
