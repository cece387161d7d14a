//! Resolved options for one run, derived from the CLI arguments plus the
//! layered configuration.

use turborepo_cache::{CacheOpts, RemoteCacheOpts};

use crate::{
    cli::{DryRunMode, EnvMode, LogOrder, OutputLogsMode, RunArgs},
    config::{parse_concurrency, ConfigurationOptions, Error},
};

#[derive(Debug, Clone)]
pub struct Opts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
    pub runcache_opts: RunCacheOpts,
    pub scope_opts: ScopeOpts,
}

#[derive(Debug, Clone)]
pub struct RunOpts {
    pub tasks: Vec<String>,
    pub concurrency: u32,
    pub parallel: bool,
    pub continue_on_error: bool,
    pub only: bool,
    pub dry_run: Option<DryRunMode>,
    pub env_mode: EnvMode,
    pub framework_inference: bool,
    pub pass_through_args: Vec<String>,
    pub log_order: LogOrder,
    pub summarize: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunCacheOpts {
    pub skip_reads: bool,
    pub skip_writes: bool,
    pub task_output_logs_override: Option<OutputLogsMode>,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeOpts {
    pub filter_patterns: Vec<String>,
    pub affected: bool,
    pub scm_base: Option<String>,
    pub scm_head: Option<String>,
}

impl Opts {
    pub fn new(args: &RunArgs, config: &ConfigurationOptions) -> Result<Self, Error> {
        let concurrency = config
            .concurrency
            .as_deref()
            .map(|raw| {
                parse_concurrency(raw).ok_or_else(|| Error::InvalidEnvValue {
                    name: "concurrency".to_string(),
                    value: raw.to_string(),
                })
            })
            .transpose()?
            .unwrap_or_else(|| num_cpus::get() as u32);

        let run_opts = RunOpts {
            tasks: args.tasks.clone(),
            concurrency,
            parallel: args.parallel,
            continue_on_error: args.continue_on_error,
            only: args.only,
            dry_run: args.dry_run,
            env_mode: args.env_mode.unwrap_or_default(),
            framework_inference: true,
            pass_through_args: args.pass_through_args.clone(),
            log_order: config.log_order.unwrap_or(LogOrder::Auto),
            summarize: config.run_summary,
        };

        let remote_cache_opts = config
            .token
            .as_ref()
            .filter(|_| config.remote_cache_enabled)
            .map(|token| RemoteCacheOpts {
                api_url: config.api_url.clone(),
                token: token.clone(),
                team_id: config.team_id.clone(),
                team_slug: config.team_slug.clone(),
                timeout_secs: config.remote_cache_timeout.unwrap_or(0),
            });

        let cache_opts = CacheOpts {
            cache_dir: config.cache_dir.clone().unwrap_or_default(),
            skip_filesystem: config.remote_only,
            skip_remote: remote_cache_opts.is_none(),
            remote_cache_read_only: false,
            workers: 10,
            remote_cache_opts,
        };

        let runcache_opts = RunCacheOpts {
            skip_reads: args.force,
            skip_writes: args.no_cache,
            task_output_logs_override: args.output_logs,
        };

        let scope_opts = ScopeOpts {
            filter_patterns: args.filter.clone(),
            affected: args.affected,
            scm_base: config.scm_base.clone(),
            scm_head: config.scm_head.clone(),
        };

        Ok(Opts {
            run_opts,
            cache_opts,
            runcache_opts,
            scope_opts,
        })
    }
}
