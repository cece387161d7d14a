//! Drives task execution: receives ready tasks from the engine walk,
//! fingerprints them, consults the cache, runs the misses, and records
//! every outcome for the summary.

use std::{
    collections::HashSet,
    io::Write,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Local;
use console::style;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_env::EnvironmentVariableMap;
use turborepo_repository::package_graph::{PackageGraph, PackageName, ROOT_PKG_NAME};
use which::which;

use crate::{
    cli::EnvMode,
    engine::{Engine, ExecutionOptions, Message, StopExecution, TaskNode},
    opts::RunOpts,
    process::{ChildExit, Command, ProcessManager},
    run::{
        cache::{CacheOutput, RunCache, TaskCache},
        summary::{
            CacheSummary, ExecutionState, RunTracker, TaskExecutionSummary, TaskSummary,
        },
        task_id::TaskId,
    },
    task_hash::{self, PackageInputsHashes, TaskHasher},
    turbo_json::TaskDefinition,
};

// How long a child gets between SIGTERM and SIGKILL.
const CHILD_STOP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Visitor<'a> {
    repo_root: &'a AbsoluteSystemPath,
    package_graph: Arc<PackageGraph>,
    run_cache: Arc<RunCache>,
    run_tracker: RunTracker,
    task_hasher: TaskHasher<'a>,
    global_env_mode: EnvMode,
    global_env: EnvironmentVariableMap,
    manager: ProcessManager,
    run_opts: &'a RunOpts,
    dry: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot find package {package_name} for task {task_id}")]
    MissingPackage {
        package_name: PackageName,
        task_id: TaskId<'static>,
    },
    #[error("could not find definition for task {0}")]
    MissingDefinition(TaskId<'static>),
    #[error("error while executing engine: {0}")]
    Engine(#[from] crate::engine::ExecuteError),
    #[error(transparent)]
    TaskHash(#[from] task_hash::Error),
    #[error("internal errors encountered: {0}")]
    InternalErrors(String),
}

// An error produced by the execution of a task, as opposed to turbo's own
// machinery.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{task_id}: {cause}")]
pub struct TaskError {
    task_id: String,
    cause: TaskErrorCause,
}

#[derive(Debug, Clone, thiserror::Error)]
enum TaskErrorCause {
    #[error("unable to spawn child process: {msg}")]
    Spawn { msg: String },
    #[error("command {command} exited ({exit_code})")]
    Exit { command: String, exit_code: i32 },
    #[error("task was killed during shutdown")]
    Killed,
}

impl TaskError {
    pub fn exit_code(&self) -> Option<i32> {
        match self.cause {
            TaskErrorCause::Exit { exit_code, .. } => Some(exit_code),
            _ => None,
        }
    }
}

impl<'a> Visitor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        package_graph: Arc<PackageGraph>,
        run_cache: Arc<RunCache>,
        run_tracker: RunTracker,
        run_opts: &'a RunOpts,
        package_inputs_hashes: PackageInputsHashes,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
        global_env_mode: EnvMode,
        manager: ProcessManager,
        global_env: EnvironmentVariableMap,
    ) -> Self {
        let task_hasher = TaskHasher::new(
            package_inputs_hashes,
            run_opts,
            env_at_execution_start,
            global_hash,
        );
        Self {
            repo_root,
            package_graph,
            run_cache,
            run_tracker,
            task_hasher,
            global_env_mode,
            global_env,
            manager,
            run_opts,
            dry: false,
        }
    }

    pub fn dry_run(&mut self) {
        self.dry = true;
    }

    pub fn task_hash_tracker(&self) -> crate::task_hash::TaskHashTracker {
        self.task_hasher.task_hash_tracker()
    }

    #[tracing::instrument(skip_all)]
    pub async fn visit(&self, engine: Arc<Engine>) -> Result<Vec<TaskError>, Error> {
        let concurrency = self.run_opts.concurrency as usize;
        let (node_sender, mut node_stream) = mpsc::channel(concurrency);

        let engine_handle = {
            let engine = engine.clone();
            tokio::spawn(engine.execute(
                ExecutionOptions::new(self.run_opts.parallel, concurrency),
                node_sender,
            ))
        };

        let errors: Arc<Mutex<Vec<TaskError>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = FuturesUnordered::new();
        let mut scheduled: HashSet<TaskId<'static>> = HashSet::new();

        while let Some(message) = node_stream.recv().await {
            let Message { info, callback } = message;
            let package_name = PackageName::from(info.package());
            scheduled.insert(info.clone());

            let workspace_info = self
                .package_graph
                .package_info(&package_name)
                .ok_or_else(|| Error::MissingPackage {
                    package_name: package_name.clone(),
                    task_id: info.clone(),
                })?;

            let command = workspace_info
                .package_json
                .scripts
                .get(info.task())
                .cloned();

            let task_definition = engine
                .task_definition(&info)
                .ok_or_else(|| Error::MissingDefinition(info.clone()))?
                .clone();

            // The per-task env mode follows the same inference upgrade as
            // the global one: a declared pass-through list means strict.
            let task_env_mode = match task_definition.env_mode.unwrap_or(self.global_env_mode) {
                EnvMode::Infer if task_definition.pass_through_env.is_some() => EnvMode::Strict,
                EnvMode::Infer => EnvMode::Loose,
                other => other,
            };

            let dependency_set = engine
                .dependencies(&info)
                .ok_or_else(|| Error::MissingDefinition(info.clone()))?;

            let task_hash = self.task_hasher.calculate_task_hash(
                &info,
                &task_definition,
                task_env_mode,
                workspace_info,
                dependency_set,
            )?;
            debug!("task {} hash is {}", info, task_hash);

            let execution_env =
                self.task_hasher
                    .env(&info, task_env_mode, &task_definition, &self.global_env)?;

            let task_cache = self.run_cache.task_cache(
                task_definition.clone(),
                workspace_info,
                info.clone(),
                &task_hash,
            );

            let base_summary = self.base_task_summary(
                &info,
                &engine,
                &task_definition,
                command.clone().unwrap_or_default(),
                &task_hash,
                task_env_mode,
            );

            if self.dry {
                let run_tracker = self.run_tracker.clone();
                let hash_tracker = self.task_hasher.task_hash_tracker();
                let info = info.clone();
                tasks.push(tokio::spawn(async move {
                    let mut summary = base_summary;
                    if let Ok(Some(status)) = task_cache.exists().await {
                        hash_tracker.insert_cache_status(info.clone(), status);
                        summary.cache = CacheSummary::from(Some(status));
                    }
                    run_tracker.add_task_summary(summary);
                    callback.send(Ok(())).ok();
                    Ok(())
                }));
                continue;
            }

            // A task with no script to run has nothing to execute or cache;
            // dropping the callback marks it finished.
            if command.as_deref().map_or(true, str::is_empty) {
                continue;
            }

            let workspace_directory = self.repo_root.resolve(workspace_info.package_path());
            let takes_input = task_definition.interactive || task_definition.persistent;
            let exec_context = ExecContext {
                task_id: info.clone(),
                task_hash: task_hash.clone(),
                task_cache,
                workspace_directory,
                execution_env,
                continue_on_error: self.run_opts.continue_on_error,
                pass_through_args: self.run_opts.pass_through_args.clone(),
                manager: self.manager.clone(),
                hash_tracker: self.task_hasher.task_hash_tracker(),
                run_tracker: self.run_tracker.clone(),
                errors: errors.clone(),
                base_summary,
                takes_input,
                package_manager_command: self
                    .package_graph
                    .package_manager()
                    .command()
                    .to_string(),
                arg_separator: self
                    .package_graph
                    .package_manager()
                    .arg_separator()
                    .map(|s| s.to_string()),
            };

            tasks.push(tokio::spawn(exec_context.execute(callback)));
        }

        // Wait for the engine and all in-flight tasks to settle.
        engine_handle.await.expect("engine execution panicked")?;
        let mut internal_errors = Vec::new();
        while let Some(joined) = tasks.next().await {
            if let Err(e) = joined.unwrap_or_else(|e| panic!("task executor panicked: {e}")) {
                internal_errors.push(e);
            }
        }

        if !internal_errors.is_empty() {
            return Err(Error::InternalErrors(
                internal_errors
                    .into_iter()
                    .map(|e: std::io::Error| e.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ));
        }

        // Anything the walk never reached was skipped because an upstream
        // task failed.
        for task_id in engine.task_ids() {
            if !scheduled.contains(task_id) {
                self.run_tracker.add_task_summary(TaskSummary {
                    execution: Some(TaskExecutionSummary {
                        state: ExecutionState::Skipped,
                        start_time: 0,
                        end_time: 0,
                        exit_code: None,
                        error: Some("upstream-failed".to_string()),
                    }),
                    ..self.base_task_summary(
                        task_id,
                        &engine,
                        engine
                            .task_definition(task_id)
                            .expect("scheduled tasks have definitions"),
                        String::new(),
                        "",
                        self.global_env_mode,
                    )
                });
            }
        }

        let errors = Arc::into_inner(errors)
            .expect("only one strong reference to errors remains")
            .into_inner()
            .expect("errors mutex poisoned");
        Ok(errors)
    }

    fn base_task_summary(
        &self,
        task_id: &TaskId<'static>,
        engine: &Engine,
        task_definition: &TaskDefinition,
        command: String,
        task_hash: &str,
        env_mode: EnvMode,
    ) -> TaskSummary {
        let mut dependencies: Vec<TaskId<'static>> = engine
            .dependencies(task_id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|node| match node {
                TaskNode::Task(dep) => Some(dep.clone()),
                TaskNode::Root => None,
            })
            .collect();
        dependencies.sort();
        let mut dependents: Vec<TaskId<'static>> = engine
            .dependents(task_id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|node| match node {
                TaskNode::Task(dep) => Some(dep.clone()),
                TaskNode::Root => None,
            })
            .collect();
        dependents.sort();

        let package_dir = self
            .package_graph
            .package_info(&PackageName::from(task_id.package()))
            .map(|info| info.package_path().to_unix())
            .unwrap_or_default();
        let log_file = package_dir
            .join(&TaskDefinition::workspace_relative_log_file(task_id.task()))
            .into_string();

        TaskSummary {
            task: task_id.task().to_string(),
            package: task_id.package().to_string(),
            task_id: task_id.clone(),
            hash: task_hash.to_string(),
            command,
            cache: CacheSummary::from(None),
            outputs: task_definition.outputs.inclusions.clone(),
            log_file,
            dependencies,
            dependents,
            framework: self.task_hasher.task_hash_tracker().framework(task_id),
            env_mode,
            resolved_task_definition: task_definition.clone(),
            execution: None,
            expanded_outputs: Vec::new(),
        }
    }
}

/// Prefixes every line with the task id, the way grouped logs read.
struct PrefixedWriter<W: Write> {
    prefix: String,
    writer: W,
    at_line_start: bool,
}

impl<W: Write> PrefixedWriter<W> {
    fn new(prefix: String, writer: W) -> Self {
        Self {
            prefix,
            writer,
            at_line_start: true,
        }
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for chunk in buf.split_inclusive(|b| *b == b'\n') {
            if self.at_line_start {
                self.writer.write_all(self.prefix.as_bytes())?;
            }
            self.writer.write_all(chunk)?;
            self.at_line_start = chunk.ends_with(b"\n");
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

struct TaskCacheOutput {
    prefix: String,
}

impl CacheOutput for TaskCacheOutput {
    fn status(&mut self, message: &str) {
        println!("{}: {}", style(&self.prefix).bold(), message);
    }

    fn error(&mut self, message: &str) {
        eprintln!("{}: {}", style(&self.prefix).bold().red(), message);
    }

    fn replay_logs(&mut self, log_file: &AbsoluteSystemPath) -> std::io::Result<()> {
        let writer = PrefixedWriter::new(format!("{}: ", self.prefix), std::io::stdout());
        crate::run::cache::replay_logs(writer, log_file)
    }
}

struct ExecContext {
    task_id: TaskId<'static>,
    task_hash: String,
    task_cache: TaskCache,
    workspace_directory: AbsoluteSystemPathBuf,
    execution_env: EnvironmentVariableMap,
    continue_on_error: bool,
    pass_through_args: Vec<String>,
    manager: ProcessManager,
    hash_tracker: crate::task_hash::TaskHashTracker,
    run_tracker: RunTracker,
    errors: Arc<Mutex<Vec<TaskError>>>,
    base_summary: TaskSummary,
    takes_input: bool,
    package_manager_command: String,
    arg_separator: Option<String>,
}

impl ExecContext {
    async fn execute(
        mut self,
        callback: tokio::sync::oneshot::Sender<Result<(), StopExecution>>,
    ) -> Result<(), std::io::Error> {
        let started_at = Local::now().timestamp_millis();
        let task_start = Instant::now();
        let mut output = TaskCacheOutput {
            prefix: self.task_id.to_string(),
        };

        // Cache first.
        match self.task_cache.restore_outputs(&mut output).await {
            Ok(Some(status)) => {
                self.hash_tracker.insert_cache_status(self.task_id.clone(), status);
                self.hash_tracker.insert_expanded_outputs(
                    self.task_id.clone(),
                    self.task_cache.expanded_outputs().to_vec(),
                );
                self.finish(
                    ExecutionState::Cached,
                    started_at,
                    None,
                    Some(CacheSummary::from(Some(status))),
                );
                callback.send(Ok(())).ok();
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                output.error(&format!("error fetching from cache: {e}"));
            }
        }

        // Build the command: `<package manager> run <task> [-- args]`.
        let package_manager_binary = match which(&self.package_manager_command) {
            Ok(binary) => binary,
            Err(e) => {
                let cause = TaskErrorCause::Spawn { msg: e.to_string() };
                self.record_error(&cause);
                self.finish(ExecutionState::Failed, started_at, Some(&cause), None);
                callback
                    .send(if self.continue_on_error {
                        Ok(())
                    } else {
                        Err(StopExecution)
                    })
                    .ok();
                return Ok(());
            }
        };
        let mut cmd = Command::new(package_manager_binary);
        let mut args = vec!["run".to_string(), self.task_id.task().to_string()];
        if !self.pass_through_args.is_empty() {
            args.extend(self.arg_separator.clone());
            args.extend(self.pass_through_args.iter().cloned());
        }
        cmd.args(args);
        cmd.current_dir(self.workspace_directory.clone());
        // The child environment is exactly what env-mode resolution
        // produced, plus the hash for tooling that wants it.
        cmd.env_clear();
        cmd.envs(self.execution_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        cmd.env("TURBO_HASH", &self.task_hash);
        if !self.takes_input {
            cmd.open_stdin();
        }

        let mut process = match self.manager.spawn(cmd, CHILD_STOP_TIMEOUT) {
            Some(Ok(child)) => child,
            Some(Err(e)) => {
                output.error(&format!("command finished with error: {e}"));
                let cause = TaskErrorCause::Spawn { msg: e.to_string() };
                self.record_error(&cause);
                self.finish(ExecutionState::Failed, started_at, Some(&cause), None);
                callback
                    .send(if self.continue_on_error {
                        Ok(())
                    } else {
                        Err(StopExecution)
                    })
                    .ok();
                return Ok(());
            }
            // The manager is shutting down; nothing new starts.
            None => {
                self.finish(ExecutionState::Canceled, started_at, None, None);
                callback.send(Err(StopExecution)).ok();
                return Ok(());
            }
        };

        let prefixed = PrefixedWriter::new(
            format!("{}: ", self.task_id),
            std::io::stdout(),
        );
        let mut stdout_writer = match self.task_cache.output_writer(prefixed) {
            Ok(writer) => writer,
            Err(e) => {
                error!("failed to create output writer: {e}");
                self.finish(ExecutionState::Failed, started_at, None, None);
                callback.send(Err(StopExecution)).ok();
                return Ok(());
            }
        };

        let exit_status = process.wait_with_piped_outputs(&mut stdout_writer).await?;
        let task_duration = task_start.elapsed();

        match exit_status {
            Some(ChildExit::Finished(Some(0))) => {
                stdout_writer.flush()?;
                if let Err(e) = self
                    .task_cache
                    .save_outputs(task_duration.as_millis() as u64)
                    .await
                {
                    error!("error caching output: {e}");
                } else {
                    self.hash_tracker.insert_expanded_outputs(
                        self.task_id.clone(),
                        self.task_cache.expanded_outputs().to_vec(),
                    );
                }
                self.finish(ExecutionState::Built, started_at, None, None);
                callback.send(Ok(())).ok();
            }
            Some(ChildExit::Finished(Some(code))) => {
                stdout_writer.flush()?;
                self.task_cache.on_error(&mut output);
                let cause = TaskErrorCause::Exit {
                    command: process.label().to_string(),
                    exit_code: code,
                };
                if self.continue_on_error {
                    output.status("command finished with error, but continuing...");
                } else {
                    output.error(&format!("command finished with error: {cause}"));
                }
                self.record_error(&cause);
                self.finish(ExecutionState::Failed, started_at, Some(&cause), None);
                callback
                    .send(if self.continue_on_error {
                        Ok(())
                    } else {
                        Err(StopExecution)
                    })
                    .ok();
                if !self.continue_on_error {
                    self.manager.stop().await;
                }
            }
            Some(ChildExit::Killed) | Some(ChildExit::KilledExternal) => {
                self.finish(
                    ExecutionState::Canceled,
                    started_at,
                    Some(&TaskErrorCause::Killed),
                    None,
                );
                callback.send(Err(StopExecution)).ok();
            }
            Some(ChildExit::Finished(None)) | Some(ChildExit::Failed) | None => {
                let cause = TaskErrorCause::Spawn {
                    msg: "unable to determine why child exited".to_string(),
                };
                self.record_error(&cause);
                self.finish(ExecutionState::Failed, started_at, Some(&cause), None);
                callback.send(Err(StopExecution)).ok();
                self.manager.stop().await;
            }
        }

        Ok(())
    }

    fn record_error(&self, cause: &TaskErrorCause) {
        self.errors
            .lock()
            .expect("errors mutex poisoned")
            .push(TaskError {
                task_id: self.task_id.to_string(),
                cause: cause.clone(),
            });
    }

    fn finish(
        &mut self,
        state: ExecutionState,
        started_at: i64,
        cause: Option<&TaskErrorCause>,
        cache: Option<CacheSummary>,
    ) {
        let mut summary = self.base_summary.clone();
        summary.cache = cache.unwrap_or_else(|| CacheSummary::from(None));
        summary.expanded_outputs = self.task_cache.expanded_outputs().to_vec();
        summary.execution = Some(TaskExecutionSummary {
            state,
            start_time: started_at,
            end_time: Local::now().timestamp_millis(),
            exit_code: match (state, cause) {
                (ExecutionState::Built | ExecutionState::Cached, _) => Some(0),
                (_, Some(TaskErrorCause::Exit { exit_code, .. })) => Some(*exit_code),
                _ => None,
            },
            error: cause.map(|cause| cause.to_string()),
        });
        self.run_tracker.add_task_summary(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_writer_prefixes_each_line() {
        let mut buffer = Vec::new();
        {
            let mut writer = PrefixedWriter::new("web#build: ".to_string(), &mut buffer);
            writer.write_all(b"one\ntwo").unwrap();
            writer.write_all(b" continued\nthree\n").unwrap();
        }
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "web#build: one\nweb#build: two continued\nweb#build: three\n"
        );
    }
}
