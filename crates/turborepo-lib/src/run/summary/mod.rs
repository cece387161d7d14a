//! Aggregation and rendering of per-task results: the end-of-run text
//! summary, `--dry-run` output in both flavors, and the persisted
//! `.turbo/runs/<id>.json` file.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Local};
use console::style;
use serde::Serialize;
use svix_ksuid::{Ksuid, KsuidLike};
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_cache::{CacheHitMetadata, CacheSource};

use crate::{
    cli::{DryRunMode, EnvMode},
    run::task_id::TaskId,
    turbo_json::TaskDefinition,
};

const RUNS_DIR: &str = ".turbo/runs";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to serialize run summary: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write run summary: {0}")]
    Write(#[from] turbopath::PathError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionState {
    Built,
    Cached,
    Failed,
    Skipped,
    Canceled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionSummary {
    pub state: ExecutionState,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'static str>,
    pub time_saved: u64,
}

impl From<Option<CacheHitMetadata>> for CacheSummary {
    fn from(metadata: Option<CacheHitMetadata>) -> Self {
        match metadata {
            Some(metadata) => CacheSummary {
                status: "HIT",
                source: Some(match metadata.source {
                    CacheSource::Local => "LOCAL",
                    CacheSource::Remote => "REMOTE",
                }),
                time_saved: metadata.time_saved,
            },
            None => CacheSummary {
                status: "MISS",
                source: None,
                time_saved: 0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub command: String,
    pub cache: CacheSummary,
    pub outputs: Vec<String>,
    pub log_file: String,
    pub dependencies: Vec<TaskId<'static>>,
    pub dependents: Vec<TaskId<'static>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<&'static str>,
    pub env_mode: EnvMode,
    pub resolved_task_definition: TaskDefinition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<TaskExecutionSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expanded_outputs: Vec<AnchoredSystemPathBuf>,
}

/// The `globalCacheInputs` block of the summary.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHashSummary {
    pub global_cache_key: &'static str,
    pub files: BTreeMap<String, String>,
    pub hash_of_external_dependencies: String,
    pub global_env_vars: Vec<String>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub global_dot_env_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScmSummary {
    #[serde(rename = "type")]
    pub scm_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub command: String,
    pub success: usize,
    pub failed: usize,
    pub cached: usize,
    pub attempted: usize,
    pub start_time: i64,
    pub end_time: i64,
    pub exit_code: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub version: &'static str,
    pub turbo_version: &'static str,
    pub monorepo: bool,
    pub global_hash: String,
    pub global_cache_inputs: GlobalHashSummary,
    pub env_mode: EnvMode,
    pub scm: ScmSummary,
    pub execution: ExecutionSummary,
    pub tasks: Vec<TaskSummary>,
}

/// Collects task summaries as the run progresses and renders the final
/// artifacts.
#[derive(Clone)]
pub struct RunTracker {
    started_at: DateTime<Local>,
    command: String,
    turbo_version: &'static str,
    tasks: Arc<Mutex<Vec<TaskSummary>>>,
}

impl RunTracker {
    pub fn new(
        started_at: DateTime<Local>,
        command: String,
        turbo_version: &'static str,
    ) -> Self {
        RunTracker {
            started_at,
            command,
            turbo_version,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_task_summary(&self, summary: TaskSummary) {
        self.tasks
            .lock()
            .expect("run tracker mutex poisoned")
            .push(summary);
    }

    pub fn into_summary(
        self,
        exit_code: i32,
        global_hash: String,
        global_cache_inputs: GlobalHashSummary,
        env_mode: EnvMode,
        is_git: bool,
    ) -> RunSummary {
        let mut tasks = Arc::into_inner(self.tasks)
            .expect("no other references to run tracker remain")
            .into_inner()
            .expect("run tracker mutex poisoned");
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let (mut success, mut failed, mut cached, mut attempted) = (0, 0, 0, 0);
        for task in &tasks {
            match task.execution.as_ref().map(|execution| execution.state) {
                Some(ExecutionState::Built) => {
                    success += 1;
                    attempted += 1;
                }
                Some(ExecutionState::Cached) => {
                    success += 1;
                    cached += 1;
                    attempted += 1;
                }
                Some(ExecutionState::Failed) => {
                    failed += 1;
                    attempted += 1;
                }
                Some(ExecutionState::Skipped | ExecutionState::Canceled) | None => {
                    attempted += 1;
                }
            }
        }

        let ended_at = Local::now();
        RunSummary {
            id: Ksuid::new(None, None).to_string(),
            version: "1",
            turbo_version: self.turbo_version,
            monorepo: true,
            global_hash,
            global_cache_inputs,
            env_mode,
            scm: ScmSummary {
                scm_type: if is_git { "git" } else { "manual" },
            },
            execution: ExecutionSummary {
                command: self.command,
                success,
                failed,
                cached,
                attempted,
                start_time: self.started_at.timestamp_millis(),
                end_time: ended_at.timestamp_millis(),
                exit_code,
            },
            tasks,
        }
    }
}

impl RunSummary {
    /// The closing lines of a real run.
    pub fn print_text(&self, elapsed: Duration) {
        let full_turbo = self.execution.attempted > 0
            && self.execution.cached == self.execution.attempted
            && self.execution.failed == 0;

        println!();
        println!(
            " {}    {} successful, {} total",
            style("Tasks:").bold(),
            self.execution.success,
            self.execution.attempted
        );
        println!(
            "{}    {} cached, {} total",
            style("Cached:").bold(),
            self.execution.cached,
            self.execution.attempted
        );
        let elapsed = format!("{:.2}s", elapsed.as_secs_f64());
        if full_turbo {
            println!(
                "  {}    {} {}",
                style("Time:").bold(),
                elapsed,
                style(">>> FULL TURBO").yellow().bold()
            );
        } else {
            println!("  {}    {}", style("Time:").bold(), elapsed);
        }
        println!();
    }

    /// `--dry-run` rendering; json mode emits the whole summary.
    pub fn print_dry_run(&self, mode: DryRunMode) -> Result<(), Error> {
        match mode {
            DryRunMode::Json => {
                println!("{}", serde_json::to_string_pretty(self)?);
            }
            DryRunMode::Text => {
                println!();
                println!("{}", style("Tasks to Run").bold().underlined());
                for task in &self.tasks {
                    println!("{}", style(&task.task_id).bold());
                    println!("  Task                   = {}", task.task);
                    println!("  Package                = {}", task.package);
                    println!("  Hash                   = {}", task.hash);
                    println!("  Command                = {}", task.command);
                    println!("  Cached (Local)         = {}", task.cache.status == "HIT");
                    println!("  Log File               = {}", task.log_file);
                    println!(
                        "  Dependencies           = {}",
                        join_ids(&task.dependencies)
                    );
                    println!(
                        "  Dependents             = {}",
                        join_ids(&task.dependents)
                    );
                }
            }
        }
        Ok(())
    }

    /// Saves the machine-readable summary under `.turbo/runs`.
    pub fn save(&self, repo_root: &AbsoluteSystemPath) -> Result<(), Error> {
        let summary_path = repo_root
            .join_unix_path(
                turbopath::RelativeUnixPath::new(RUNS_DIR).expect("runs dir is relative"),
            )
            .join_component(&format!("{}.json", self.id));
        summary_path.ensure_dir()?;
        summary_path.create_with_contents(serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn maybe_save(&self, enabled: bool, repo_root: &AbsoluteSystemPath) {
        if !enabled {
            return;
        }
        if let Err(e) = self.save(repo_root) {
            warn!("failed to save run summary: {e}");
        }
    }
}

fn join_ids(ids: &[TaskId<'static>]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_summary(task_id: TaskId<'static>, state: ExecutionState) -> TaskSummary {
        TaskSummary {
            task: task_id.task().to_string(),
            package: task_id.package().to_string(),
            task_id,
            hash: "cafef00d".to_string(),
            command: "echo build".to_string(),
            cache: CacheSummary::from(None),
            outputs: vec![],
            log_file: ".turbo/turbo-build.log".to_string(),
            dependencies: vec![],
            dependents: vec![],
            framework: None,
            env_mode: EnvMode::Loose,
            resolved_task_definition: TaskDefinition::default(),
            execution: Some(TaskExecutionSummary {
                state,
                start_time: 0,
                end_time: 1,
                exit_code: match state {
                    ExecutionState::Failed => Some(1),
                    _ => Some(0),
                },
                error: None,
            }),
            expanded_outputs: vec![],
        }
    }

    #[test]
    fn test_execution_counts() {
        let tracker = RunTracker::new(Local::now(), "turbo run build".to_string(), "2.0.0");
        tracker.add_task_summary(task_summary(
            TaskId::new("a", "build").into_owned(),
            ExecutionState::Built,
        ));
        tracker.add_task_summary(task_summary(
            TaskId::new("b", "build").into_owned(),
            ExecutionState::Cached,
        ));
        tracker.add_task_summary(task_summary(
            TaskId::new("c", "build").into_owned(),
            ExecutionState::Failed,
        ));

        let summary = tracker.into_summary(
            1,
            "globalhash".to_string(),
            GlobalHashSummary::default(),
            EnvMode::Infer,
            true,
        );
        assert_eq!(summary.execution.success, 2);
        assert_eq!(summary.execution.cached, 1);
        assert_eq!(summary.execution.failed, 1);
        assert_eq!(summary.execution.attempted, 3);
        // tasks are sorted by id for deterministic output
        assert_eq!(summary.tasks[0].package, "a");
    }

    #[test]
    fn test_summary_serialization_field_names() {
        let tracker = RunTracker::new(Local::now(), "turbo run build".to_string(), "2.0.0");
        tracker.add_task_summary(task_summary(
            TaskId::new("a", "build").into_owned(),
            ExecutionState::Cached,
        ));
        let summary = tracker.into_summary(
            0,
            "globalhash".to_string(),
            GlobalHashSummary::default(),
            EnvMode::Strict,
            true,
        );

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&summary).unwrap()).unwrap();
        assert!(json.get("tasks").is_some());
        assert!(json.get("globalCacheInputs").is_some());
        assert_eq!(json["envMode"], "strict");
        assert_eq!(json["scm"]["type"], "git");
        assert!(json.get("turboVersion").is_some());
        assert_eq!(json["tasks"][0]["taskId"], "a#build");
        assert_eq!(json["tasks"][0]["cache"]["status"], "HIT");
    }

    #[test]
    fn test_save_writes_under_turbo_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::from_std_path(
            &tmp.path().canonicalize().unwrap(),
        )
        .unwrap();
        let tracker = RunTracker::new(Local::now(), "turbo run build".to_string(), "2.0.0");
        let summary = tracker.into_summary(
            0,
            "globalhash".to_string(),
            GlobalHashSummary::default(),
            EnvMode::Infer,
            false,
        );
        summary.save(&repo_root).unwrap();

        let runs_dir = repo_root.join_components(&[".turbo", "runs"]);
        let entries: Vec<_> = std::fs::read_dir(runs_dir.as_std_path())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
