//! The `turbo.json` configuration model: the raw serde shape, the
//! validated form, and the per-task definition it produces.

mod loader;

use std::collections::BTreeMap;

pub use loader::TurboJsonLoader;
use serde::{Deserialize, Serialize};
use turbopath::RelativeUnixPathBuf;

use crate::{
    cli::{EnvMode, OutputLogsMode},
    config::Error,
    run::task_id::{TaskId, TaskName},
};

pub const CONFIG_FILE: &str = "turbo.json";

/// The serde-facing shape of a turbo.json file. Unknown keys are ignored;
/// `//`-prefixed keys serve as comments by convention.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTurboJson {
    #[serde(default)]
    pub extends: Option<Vec<String>>,
    /// `tasks` is the current name for the pipeline map; `pipeline` is the
    /// legacy alias. Declaring both is an error.
    #[serde(default)]
    pub tasks: Option<BTreeMap<String, RawTaskDefinition>>,
    #[serde(default)]
    pub pipeline: Option<BTreeMap<String, RawTaskDefinition>>,
    #[serde(default)]
    pub global_dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub global_env: Option<Vec<String>>,
    #[serde(default)]
    pub global_pass_through_env: Option<Vec<String>>,
    #[serde(default)]
    pub global_dot_env: Option<Vec<String>>,
    #[serde(default)]
    pub remote_cache: Option<RawRemoteCacheOptions>,
    #[serde(default)]
    pub env_mode: Option<EnvMode>,
    #[serde(default)]
    pub ui: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRemoteCacheOptions {
    pub enabled: Option<bool>,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
    pub api_url: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTaskDefinition {
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub pass_through_env: Option<Vec<String>>,
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub cache: Option<bool>,
    #[serde(default, alias = "outputLogs")]
    pub output_mode: Option<OutputLogsMode>,
    #[serde(default)]
    pub persistent: Option<bool>,
    #[serde(default)]
    pub interactive: Option<bool>,
    #[serde(default)]
    pub env_mode: Option<EnvMode>,
    #[serde(default)]
    pub dot_env: Option<Vec<String>>,
}

impl RawTaskDefinition {
    /// Field-level inheritance: fields set on `self` win, everything else
    /// comes from `base`.
    pub fn merge_onto(self, base: &RawTaskDefinition) -> RawTaskDefinition {
        RawTaskDefinition {
            depends_on: self.depends_on.or_else(|| base.depends_on.clone()),
            env: self.env.or_else(|| base.env.clone()),
            pass_through_env: self
                .pass_through_env
                .or_else(|| base.pass_through_env.clone()),
            outputs: self.outputs.or_else(|| base.outputs.clone()),
            inputs: self.inputs.or_else(|| base.inputs.clone()),
            cache: self.cache.or(base.cache),
            output_mode: self.output_mode.or(base.output_mode),
            persistent: self.persistent.or(base.persistent),
            interactive: self.interactive.or(base.interactive),
            env_mode: self.env_mode.or(base.env_mode),
            dot_env: self.dot_env.or_else(|| base.dot_env.clone()),
        }
    }
}

/// The pipeline: task name -> raw definition, with `//`-style comment keys
/// dropped. Keys are stored in their written form (`build`, `web#build`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline(BTreeMap<String, RawTaskDefinition>);

impl Pipeline {
    pub fn get(&self, task_name: &TaskName) -> Option<&RawTaskDefinition> {
        self.0.get(&task_name.to_string())
    }

    pub fn contains_key(&self, task_name: &TaskName) -> bool {
        self.get(task_name).is_some()
    }

    pub fn task_names(&self) -> impl Iterator<Item = TaskName<'static>> + '_ {
        self.0.keys().map(|key| TaskName::from(key.clone()))
    }

    pub fn insert(&mut self, task_name: impl Into<String>, definition: RawTaskDefinition) {
        self.0.insert(task_name.into(), definition);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A validated turbo.json.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurboJson {
    pub extends: Vec<String>,
    pub tasks: Pipeline,
    pub global_deps: Vec<String>,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub global_dot_env: Option<Vec<RelativeUnixPathBuf>>,
    pub remote_cache: Option<RawRemoteCacheOptions>,
    pub env_mode: Option<EnvMode>,
}

impl TryFrom<RawTurboJson> for TurboJson {
    type Error = Error;

    fn try_from(raw: RawTurboJson) -> Result<Self, Error> {
        let tasks = match (raw.tasks, raw.pipeline) {
            (Some(_), Some(_)) => return Err(Error::BothTasksAndPipeline),
            (Some(tasks), None) | (None, Some(tasks)) => tasks,
            (None, None) => BTreeMap::new(),
        };

        let mut pipeline = Pipeline::default();
        for (name, definition) in tasks {
            // A literal "//" key is a comment, not a task.
            if name == "//" {
                continue;
            }
            validate_task_definition(&name, &definition)?;
            pipeline.insert(name, definition);
        }

        let mut global_deps = raw.global_dependencies.unwrap_or_default();
        global_deps.sort();
        let mut global_env = raw.global_env.unwrap_or_default();
        global_env.sort();
        let global_pass_through_env = raw.global_pass_through_env.map(|mut env| {
            env.sort();
            env
        });
        let global_dot_env = raw
            .global_dot_env
            .map(|paths| {
                paths
                    .into_iter()
                    .map(RelativeUnixPathBuf::new)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .map_err(|e| Error::InvalidDotEnvPath(e.to_string()))?;

        Ok(TurboJson {
            extends: raw.extends.unwrap_or_default(),
            tasks: pipeline,
            global_deps,
            global_env,
            global_pass_through_env,
            global_dot_env,
            remote_cache: raw.remote_cache,
            env_mode: raw.env_mode,
        })
    }
}

fn validate_task_definition(name: &str, definition: &RawTaskDefinition) -> Result<(), Error> {
    // A persistent task never terminates, so a cached artifact for it could
    // never be produced. Declaring both is a configuration contradiction.
    if definition.persistent == Some(true) && definition.cache == Some(true) {
        return Err(Error::PersistentTaskWithCache {
            task: name.to_string(),
        });
    }
    Ok(())
}

impl TurboJson {
    pub fn has_task(&self, task_name: &TaskName) -> bool {
        self.tasks.task_names().any(|key| {
            key == *task_name
                || (!task_name.is_package_task() && key.task() == task_name.task())
        })
    }

    /// Resolves the raw definition for a task id in this file, preferring
    /// an exact `package#task` key over the bare task name.
    pub fn task(&self, task_id: &TaskId, task_name: &TaskName) -> Option<RawTaskDefinition> {
        self.tasks
            .get(&task_id.as_task_name())
            .or_else(|| {
                let bare = TaskName::from(task_name.task());
                self.tasks.get(&bare)
            })
            .cloned()
    }
}

/// The fully-resolved definition the engine and hasher consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDefinition {
    pub task_dependencies: Vec<TaskName<'static>>,
    pub topological_dependencies: Vec<TaskName<'static>>,
    pub cache: bool,
    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
    pub outputs: TaskOutputs,
    pub inputs: Vec<String>,
    pub output_mode: OutputLogsMode,
    pub persistent: bool,
    pub interactive: bool,
    pub env_mode: Option<EnvMode>,
    pub dot_env: Vec<RelativeUnixPathBuf>,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            task_dependencies: Vec::new(),
            topological_dependencies: Vec::new(),
            cache: true,
            env: Vec::new(),
            pass_through_env: None,
            outputs: TaskOutputs::default(),
            inputs: Vec::new(),
            output_mode: OutputLogsMode::default(),
            persistent: false,
            interactive: false,
            env_mode: None,
            dot_env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

pub const TOPOLOGICAL_PIPELINE_DELIMITER: &str = "^";
pub const LOG_DIR: &str = ".turbo";

impl TaskDefinition {
    /// The log file path for a task, relative to its package directory.
    pub fn workspace_relative_log_file(task_name: &str) -> RelativeUnixPathBuf {
        RelativeUnixPathBuf::new(format!("{LOG_DIR}/turbo-{task_name}.log"))
            .expect("log file path is relative")
    }

    /// The outputs that participate in hashing: declared globs plus the log
    /// file, sorted for stability.
    pub fn hashable_outputs(&self, task_id: &TaskId) -> TaskOutputs {
        let log_file = Self::workspace_relative_log_file(task_id.task());
        let mut inclusions = self.outputs.inclusions.clone();
        inclusions.push(log_file.into_string());
        inclusions.sort();

        let mut exclusions = self.outputs.exclusions.clone();
        exclusions.sort();

        TaskOutputs {
            inclusions,
            exclusions,
        }
    }
}

impl TryFrom<RawTaskDefinition> for TaskDefinition {
    type Error = Error;

    fn try_from(raw: RawTaskDefinition) -> Result<Self, Error> {
        let mut task_dependencies = Vec::new();
        let mut topological_dependencies = Vec::new();
        for dep in raw.depends_on.unwrap_or_default() {
            if let Some(topo) = dep.strip_prefix(TOPOLOGICAL_PIPELINE_DELIMITER) {
                topological_dependencies.push(TaskName::from(topo.to_string()));
            } else {
                task_dependencies.push(TaskName::from(dep));
            }
        }
        task_dependencies.sort();
        topological_dependencies.sort();

        let mut inclusions = Vec::new();
        let mut exclusions = Vec::new();
        for output in raw.outputs.unwrap_or_default() {
            if let Some(exclusion) = output.strip_prefix('!') {
                exclusions.push(exclusion.to_string());
            } else {
                inclusions.push(output);
            }
        }
        inclusions.sort();
        exclusions.sort();

        let mut env = raw.env.unwrap_or_default();
        env.sort();
        let pass_through_env = raw.pass_through_env.map(|mut env| {
            env.sort();
            env
        });

        let persistent = raw.persistent.unwrap_or_default();
        let cache = match raw.cache {
            Some(cache) => cache,
            // Persistent tasks never finish, so there is nothing to cache.
            None => !persistent,
        };

        let dot_env = raw
            .dot_env
            .unwrap_or_default()
            .into_iter()
            .map(RelativeUnixPathBuf::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidDotEnvPath(e.to_string()))?;

        Ok(TaskDefinition {
            task_dependencies,
            topological_dependencies,
            cache,
            env,
            pass_through_env,
            outputs: TaskOutputs {
                inclusions,
                exclusions,
            },
            inputs: raw.inputs.unwrap_or_default(),
            output_mode: raw.output_mode.unwrap_or_default(),
            persistent,
            interactive: raw.interactive.unwrap_or_default(),
            env_mode: raw.env_mode,
            dot_env,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(r#"{}"#, TurboJson::default() ; "empty")]
    #[test_case(
        r#"{ "globalDependencies": ["tsconfig.json", "jest.config.js"] }"#,
        TurboJson {
            global_deps: vec!["jest.config.js".to_string(), "tsconfig.json".to_string()],
            ..TurboJson::default()
        }
    ; "global dependencies sorted")]
    #[test_case(
        r#"{ "globalPassThroughEnv": ["GITHUB_TOKEN", "AWS_SECRET_KEY"] }"#,
        TurboJson {
            global_pass_through_env: Some(vec![
                "AWS_SECRET_KEY".to_string(),
                "GITHUB_TOKEN".to_string(),
            ]),
            ..TurboJson::default()
        }
    ; "global pass through sorted")]
    #[test_case(r#"{ "//": "a comment" }"#, TurboJson::default() ; "top level comment key")]
    fn test_parse_turbo_json(content: &str, expected: TurboJson) {
        let raw: RawTurboJson = serde_json::from_str(content).unwrap();
        assert_eq!(TurboJson::try_from(raw).unwrap(), expected);
    }

    #[test]
    fn test_tasks_and_pipeline_conflict() {
        let raw: RawTurboJson = serde_json::from_str(
            r#"{ "tasks": { "build": {} }, "pipeline": { "build": {} } }"#,
        )
        .unwrap();
        assert!(matches!(
            TurboJson::try_from(raw),
            Err(Error::BothTasksAndPipeline)
        ));
    }

    #[test]
    fn test_pipeline_alias_accepted() {
        let raw: RawTurboJson =
            serde_json::from_str(r#"{ "pipeline": { "build": {} } }"#).unwrap();
        let turbo_json = TurboJson::try_from(raw).unwrap();
        assert!(turbo_json.has_task(&TaskName::from("build")));
    }

    #[test]
    fn test_persistent_cached_task_is_rejected() {
        let raw: RawTurboJson = serde_json::from_str(
            r#"{ "tasks": { "dev": { "persistent": true, "cache": true } } }"#,
        )
        .unwrap();
        assert!(matches!(
            TurboJson::try_from(raw),
            Err(Error::PersistentTaskWithCache { task }) if task == "dev"
        ));
    }

    #[test]
    fn test_persistent_task_defaults_to_uncached() {
        let raw = RawTaskDefinition {
            persistent: Some(true),
            ..RawTaskDefinition::default()
        };
        let definition = TaskDefinition::try_from(raw).unwrap();
        assert!(!definition.cache);
        assert!(definition.persistent);
    }

    #[test]
    fn test_depends_on_classification() {
        let raw: RawTaskDefinition = serde_json::from_str(
            r#"{ "dependsOn": ["^build", "prepare", "util#generate"] }"#,
        )
        .unwrap();
        let definition = TaskDefinition::try_from(raw).unwrap();
        assert_eq!(
            definition.topological_dependencies,
            vec![TaskName::from("build")]
        );
        assert_eq!(
            definition.task_dependencies,
            vec![TaskName::from("prepare"), TaskName::from("util#generate")]
        );
    }

    #[test]
    fn test_output_classification() {
        let raw: RawTaskDefinition = serde_json::from_str(
            r#"{ "outputs": ["dist/**", "!dist/cache/**"] }"#,
        )
        .unwrap();
        let definition = TaskDefinition::try_from(raw).unwrap();
        assert_eq!(definition.outputs.inclusions, vec!["dist/**"]);
        assert_eq!(definition.outputs.exclusions, vec!["dist/cache/**"]);
    }

    #[test]
    fn test_hashable_outputs_include_log_file() {
        let definition = TaskDefinition::default();
        let outputs = definition.hashable_outputs(&TaskId::new("web", "build"));
        assert_eq!(outputs.inclusions, vec![".turbo/turbo-build.log"]);
    }

    #[test]
    fn test_task_resolution_prefers_package_qualified() {
        let raw: RawTurboJson = serde_json::from_str(
            r#"{ "tasks": {
                "build": { "outputs": ["dist/**"] },
                "web#build": { "outputs": ["out/**"] }
            } }"#,
        )
        .unwrap();
        let turbo_json = TurboJson::try_from(raw).unwrap();

        let web_build = turbo_json
            .task(&TaskId::new("web", "build"), &TaskName::from("build"))
            .unwrap();
        assert_eq!(web_build.outputs, Some(vec!["out/**".to_string()]));

        let docs_build = turbo_json
            .task(&TaskId::new("docs", "build"), &TaskName::from("build"))
            .unwrap();
        assert_eq!(docs_build.outputs, Some(vec!["dist/**".to_string()]));
    }
}
