//! The command-line surface the core honors. Everything else (help
//! rendering, telemetry, login flows) lives outside this crate.

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum EnvMode {
    /// Upgrades to `strict` when pass-through declarations exist, else
    /// behaves as `loose`.
    #[default]
    Infer,
    /// Every variable reaches the task; only declared ones contribute to
    /// the fingerprint.
    Loose,
    /// Only declared variables reach the task or contribute.
    Strict,
}

impl std::fmt::Display for EnvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EnvMode::Infer => "infer",
            EnvMode::Loose => "loose",
            EnvMode::Strict => "strict",
        })
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    /// Stream everything, replay everything on cache hits.
    #[default]
    Full,
    /// Print only the cache status line.
    HashOnly,
    /// Stream new executions, suppress replay on cache hits.
    NewOnly,
    /// Only surface output for failing tasks.
    ErrorsOnly,
    /// Nothing at all.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum LogOrder {
    Auto,
    Stream,
    Grouped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryRunMode {
    Text,
    Json,
}

/// `turbo run <tasks...>`.
#[derive(Debug, Default, Clone, Parser)]
pub struct RunArgs {
    /// Tasks to run across the filtered packages.
    #[clap(required = true)]
    pub tasks: Vec<String>,
    /// Package selectors; may be given multiple times.
    #[clap(long = "filter", action = ArgAction::Append)]
    pub filter: Vec<String>,
    /// Restrict to packages changed between TURBO_SCM_BASE and
    /// TURBO_SCM_HEAD.
    #[clap(long)]
    pub affected: bool,
    /// Maximum concurrently running tasks. Defaults to the CPU count.
    #[clap(long)]
    pub concurrency: Option<String>,
    /// Ignore the task graph edges and run everything at once.
    #[clap(long)]
    pub parallel: bool,
    /// Keep running unaffected tasks when one fails.
    #[clap(long = "continue")]
    pub continue_on_error: bool,
    /// Ignore cached artifacts and re-execute everything.
    #[clap(long)]
    pub force: bool,
    /// Skip writing any cache artifacts.
    #[clap(long)]
    pub no_cache: bool,
    /// Don't actually run tasks; describe what would happen.
    #[clap(long, num_args = 0..=1, default_missing_value = "text", value_parser = parse_dry_run)]
    pub dry_run: Option<DryRunMode>,
    /// How much task output to show.
    #[clap(long)]
    pub output_logs: Option<OutputLogsMode>,
    #[clap(long)]
    pub log_order: Option<LogOrder>,
    /// Run exactly the named tasks, not their dependencies.
    #[clap(long)]
    pub only: bool,
    #[clap(long)]
    pub env_mode: Option<EnvMode>,
    /// Override the local cache directory.
    #[clap(long)]
    pub cache_dir: Option<Utf8PathBuf>,
    /// Generate a run summary file under .turbo/runs.
    #[clap(long)]
    pub summarize: bool,
    /// Arguments forwarded to every task after `--`.
    #[clap(last = true)]
    pub pass_through_args: Vec<String>,
}

fn parse_dry_run(value: &str) -> Result<DryRunMode, String> {
    match value {
        "text" => Ok(DryRunMode::Text),
        "json" => Ok(DryRunMode::Json),
        other => Err(format!("invalid dry run mode: {other}")),
    }
}

#[derive(Debug, Parser)]
#[clap(name = "turbo", version, about = "The build system that makes ship happen")]
pub struct Args {
    /// Override the directory turbo treats as the repo root.
    #[clap(long, global = true)]
    pub cwd: Option<Utf8PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run tasks across the workspace.
    Run(Box<RunArgs>),
}

/// Exit codes: 0 all tasks succeeded, 1 at least one task failed, 2 the
/// invocation itself was invalid.
pub fn exit_code_for_error(err: &crate::run::Error) -> i32 {
    if err.is_invalid_invocation() {
        2
    } else {
        1
    }
}
