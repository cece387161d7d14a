//! Configuration layering.
//!
//! Values resolve in strict precedence order: command-line flags beat
//! `TURBO_*` environment variables, which beat `turbo.json`, which beats
//! built-in defaults.

use camino::Utf8PathBuf;
use thiserror::Error;
use turborepo_env::EnvironmentVariableMap;

use crate::{
    cli::{LogOrder, RunArgs},
    turbo_json::RawRemoteCacheOptions,
};

pub const DEFAULT_API_URL: &str = "https://vercel.com/api";

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not find turbo.json. Follow directions at https://turbo.build/repo/docs to create one")]
    NoTurboJson,
    #[error("unable to parse {path}: {error}")]
    TurboJsonParse {
        path: String,
        error: serde_json::Error,
    },
    #[error("found both `tasks` and the legacy `pipeline` key; remove `pipeline`")]
    BothTasksAndPipeline,
    #[error("the root turbo.json may not use `extends`")]
    RootTurboJsonExtends,
    #[error("workspace config for {package} must extend [\"//\"]")]
    InvalidWorkspaceExtends { package: String },
    #[error("task {task} is persistent and cannot be cached; remove `\"cache\": true`")]
    PersistentTaskWithCache { task: String },
    #[error("invalid dotEnv path: {0}")]
    InvalidDotEnvPath(String),
    #[error("invalid value for {name}: {value}")]
    InvalidEnvValue { name: String, value: String },
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

/// The layered, non-pipeline configuration a run consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationOptions {
    pub token: Option<String>,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
    pub api_url: String,
    pub remote_cache_enabled: bool,
    pub remote_only: bool,
    pub cache_dir: Option<Utf8PathBuf>,
    pub concurrency: Option<String>,
    pub run_summary: bool,
    pub log_order: Option<LogOrder>,
    pub scm_base: Option<String>,
    pub scm_head: Option<String>,
    pub root_turbo_json_path: Option<Utf8PathBuf>,
    pub remote_cache_timeout: Option<u64>,
}

impl ConfigurationOptions {
    /// Builds the resolved configuration from the three layers.
    pub fn build(
        remote_cache_config: Option<&RawRemoteCacheOptions>,
        environment: &EnvironmentVariableMap,
        args: &RunArgs,
    ) -> Result<Self, Error> {
        let mut options = ConfigurationOptions {
            api_url: DEFAULT_API_URL.to_string(),
            remote_cache_enabled: true,
            ..Default::default()
        };

        // Layer one: turbo.json's remoteCache block.
        if let Some(remote_cache) = remote_cache_config {
            if let Some(enabled) = remote_cache.enabled {
                options.remote_cache_enabled = enabled;
            }
            options.team_id = remote_cache.team_id.clone();
            options.team_slug = remote_cache.team_slug.clone();
            if let Some(api_url) = &remote_cache.api_url {
                options.api_url = api_url.clone();
            }
            options.remote_cache_timeout = remote_cache.timeout;
        }

        // Layer two: the environment.
        let env_var = |name: &str| environment.get(name).filter(|v| !v.is_empty()).cloned();
        if let Some(token) = env_var("TURBO_TOKEN") {
            options.token = Some(token);
        }
        if let Some(team) = env_var("TURBO_TEAM") {
            // Team slugs and ids share a variable; ids are prefixed.
            if team.starts_with("team_") {
                options.team_id = Some(team);
            } else {
                options.team_slug = Some(team);
            }
        }
        if let Some(remote_only) = env_var("TURBO_REMOTE_ONLY") {
            options.remote_only = parse_bool("TURBO_REMOTE_ONLY", &remote_only)?;
        }
        if let Some(cache_dir) = env_var("TURBO_CACHE_DIR") {
            options.cache_dir = Some(Utf8PathBuf::from(cache_dir));
        }
        if let Some(concurrency) = env_var("TURBO_CONCURRENCY") {
            options.concurrency = Some(concurrency);
        }
        if let Some(run_summary) = env_var("TURBO_RUN_SUMMARY") {
            options.run_summary = parse_bool("TURBO_RUN_SUMMARY", &run_summary)?;
        }
        if let Some(log_order) = env_var("TURBO_LOG_ORDER") {
            options.log_order = Some(match log_order.as_str() {
                "auto" => LogOrder::Auto,
                "stream" => LogOrder::Stream,
                "grouped" => LogOrder::Grouped,
                other => {
                    return Err(Error::InvalidEnvValue {
                        name: "TURBO_LOG_ORDER".to_string(),
                        value: other.to_string(),
                    })
                }
            });
        }
        options.scm_base = env_var("TURBO_SCM_BASE");
        options.scm_head = env_var("TURBO_SCM_HEAD");
        if let Some(root_turbo_json) = env_var("TURBO_ROOT_TURBO_JSON") {
            options.root_turbo_json_path = Some(Utf8PathBuf::from(root_turbo_json));
        }

        // Layer three: flags always dominate.
        if let Some(concurrency) = &args.concurrency {
            options.concurrency = Some(concurrency.clone());
        }
        if let Some(cache_dir) = &args.cache_dir {
            options.cache_dir = Some(cache_dir.clone());
        }
        if let Some(log_order) = args.log_order {
            options.log_order = Some(log_order);
        }
        if args.summarize {
            options.run_summary = true;
        }

        Ok(options)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::InvalidEnvValue {
            name: name.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Parses a concurrency value: a positive integer, or a percentage of the
/// available CPUs like `50%`.
pub fn parse_concurrency(raw: &str) -> Option<u32> {
    if let Some(percent) = raw.strip_suffix('%') {
        let percent: f64 = percent.trim().parse().ok()?;
        if percent > 0.0 && percent.is_finite() {
            return Some(((num_cpus::get() as f64 * percent / 100.0).max(1.0)) as u32);
        }
        return None;
    }
    raw.parse::<u32>().ok().filter(|n| *n > 0)
}
