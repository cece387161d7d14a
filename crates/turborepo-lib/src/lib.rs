#![deny(clippy::all)]
//! The task runner core: graph construction, fingerprinting, scheduling,
//! and caching, wired together behind the `run` command.

pub mod cli;
mod config;
mod engine;
mod framework;
mod hash;
mod opts;
mod process;
pub mod run;
pub mod signal;
mod task_graph;
mod task_hash;
mod turbo_json;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use turbopath::AbsoluteSystemPathBuf;

use crate::{
    cli::{Args, Command},
    process::ProcessManager,
    turbo_json::CONFIG_FILE,
};

/// Parses arguments, locates the repo, and executes the command. Returns
/// the process exit code.
pub async fn main() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("TURBO_LOG_VERBOSITY"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let repo_root = match infer_repo_root(&args) {
        Ok(repo_root) => repo_root,
        Err(e) => {
            eprintln!("turbo: {e}");
            return 2;
        }
    };

    match args.command {
        Command::Run(run_args) => {
            let manager = ProcessManager::new();
            signal::install(manager.clone());
            let run = run::Run::new(&repo_root, manager.clone());
            let result = run.run(&run_args).await;
            manager.stop().await;
            match result {
                Ok(exit_code) => exit_code,
                Err(e) => {
                    eprintln!("turbo: {e}");
                    cli::exit_code_for_error(&e)
                }
            }
        }
    }
}

/// The repo root is the nearest ancestor with a turbo.json, falling back
/// to the nearest ancestor that looks like a repository root.
fn infer_repo_root(args: &Args) -> Result<AbsoluteSystemPathBuf, turbopath::PathError> {
    let cwd = match &args.cwd {
        Some(cwd) => AbsoluteSystemPathBuf::from_unknown(&AbsoluteSystemPathBuf::cwd()?, cwd.to_string()),
        None => AbsoluteSystemPathBuf::cwd()?,
    };
    let root = cwd
        .ancestor_containing(CONFIG_FILE)
        .or_else(|| cwd.ancestor_containing("package-lock.json"))
        .or_else(|| cwd.ancestor_containing(".git"))
        .map(|p| p.to_owned())
        .unwrap_or(cwd);
    Ok(root)
}
