mod cli;
mod cluster;
mod config;
mod cron;
mod engine;
mod lock;
mod storage;
mod util;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::cluster::Pvesh;
use crate::config::Config;
use crate::engine::{BatchCategory, RunClock, RunContext, RunOptions, Tier, TierPolicies, TierPolicy};
use crate::lock::InstanceLock;
use crate::storage::Zfs;

#[derive(Parser)]
#[command(
    name = "pve-autosnap",
    about = "Tiered ZFS snapshots and owner markers for Proxmox VE guest disks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one snapshot pass over every pool on this node.
    Run {
        /// Tier tokens, e.g. `f4 h24 d7 m12 y3` (frequently, hourly, daily, monthly, yearly).
        #[arg(required = true)]
        tokens: Vec<String>,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Print each pool's planned batch as JSON and change nothing.
        #[arg(long)]
        dry_run: bool,
        /// Exit non-zero if any batch failed to apply.
        #[arg(long)]
        strict: bool,
    },
    /// Install or replace the crontab entry that runs this tool periodically.
    InstallCron {
        /// Tier tokens passed through to `run`.
        #[arg(required = true)]
        tokens: Vec<String>,
        /// Path to config file (TOML), also passed through to `run`.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the ZFS channel program used for a batch category.
    Program {
        #[arg(value_enum)]
        category: BatchCategory,
    },
    /// Verify prerequisites on this node. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Make zfs, zpool and pvesh resolvable under cron's minimal PATH.
    std::env::set_var("PATH", cron::augmented_path(std::env::var_os("PATH").as_deref())?);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { tokens, config: config_path, dry_run, strict } => {
            let config = cli::load_config(config_path)?;
            run_pass(&config, &tokens, dry_run, strict).await?;
        }
        Commands::InstallCron { tokens, config: config_path } => {
            let config = cli::load_config(config_path.clone())?;
            // Refuse to schedule a command line that would fail every time.
            TierPolicies::parse_tokens(&tokens)?;

            let exe = std::env::current_exe().context("resolving path of this executable")?;
            let config_path = config_path
                .map(|p| std::fs::canonicalize(&p).unwrap_or(p));
            let line = cron::cron_line(&config.schedule.cron, &exe, &tokens, config_path.as_deref());
            cron::Crontab::default().install(&exe, &line).await?;
            println!("Crontab entry installed: {}", line);
        }
        Commands::Program { category } => {
            cli::print_program(category);
        }
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config)?;
        }
    }

    Ok(())
}

/// Build the per-run context from config and CLI tokens.
fn build_context(config: &Config, tokens: &[String]) -> Result<RunContext> {
    let mut policies = TierPolicies::parse_tokens(tokens)?;
    if let Some(count) = config.retention.stopped_count {
        policies.insert(
            Tier::Stopped,
            TierPolicy {
                max_count: count,
                interval_secs: 0,
            },
        );
    }
    debug!(
        keep_stopped = policies.contains(Tier::Stopped),
        "tier policies parsed"
    );
    Ok(RunContext {
        node: config.node.resolve()?,
        clock: RunClock::now(),
        policies,
        grace_secs: config.retention.grace_secs,
    })
}

async fn run_pass(config: &Config, tokens: &[String], dry_run: bool, strict: bool) -> Result<()> {
    let ctx = build_context(config, tokens)?;

    // Held until the pass completes.
    let _lock = if dry_run {
        None
    } else {
        let lock = InstanceLock::acquire(&config.run.lock_file)?;
        debug!(path = %lock.path().display(), "holding instance lock");
        Some(lock)
    };

    let storage = Zfs::new(&config.storage);
    let pvesh = Pvesh::new(config.cluster.pvesh_binary.clone());
    let options = RunOptions {
        dry_run,
        pools: config.storage.pools.clone(),
    };

    let report = engine::run(&storage, &pvesh, &ctx, &options).await?;

    if dry_run {
        let batches: Vec<_> = report.pools.iter().map(|p| &p.batch).collect();
        let json = serde_json::to_string_pretty(&batches).context("serializing planned batches")?;
        println!("{}", json);
        return Ok(());
    }

    let failures: Vec<_> = report.failures().collect();
    for failure in &failures {
        error!(error = %failure, "batch not applied");
    }
    let failed_pools = report
        .pools
        .iter()
        .filter(|p| p.submit.as_ref().is_some_and(|s| !s.is_success()))
        .count();
    info!(
        pools = report.pools.len(),
        failed_pools,
        failed_batches = failures.len(),
        "snapshot pass finished"
    );

    if strict && !failures.is_empty() {
        anyhow::bail!("{} batch(es) failed to apply", failures.len());
    }
    Ok(())
}
