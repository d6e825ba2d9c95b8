use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::program::{program_args, source};
use super::{Dataset, OwnerMarker, Snapshot, StorageBackend};
use crate::config::StorageConfig;
use crate::engine::batch::{BatchExecutor, BatchRequest};

/// Low-level ZFS command wrapper. All operations shell out to the `zfs` and
/// `zpool` CLIs.
#[derive(Debug, Clone)]
pub struct Zfs {
    zfs_binary: PathBuf,
    zpool_binary: PathBuf,
    /// User property holding the owner marker (e.g. "label:running")
    owner_property: String,
    /// User property that opts a dataset out of scheduled snapshots
    nosnap_property: String,
    /// Value of `nosnap_property` that means "excluded"
    nosnap_value: String,
}

impl Zfs {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            zfs_binary: config.zfs_binary.clone(),
            zpool_binary: config.zpool_binary.clone(),
            owner_property: config.owner_property.clone(),
            nosnap_property: config.nosnap_property.clone(),
            nosnap_value: config.nosnap_value.clone(),
        }
    }

    /// Run `request` as a channel program against `pool`.
    ///
    /// Runs: `zfs program {pool} {script} {args...}`
    async fn run_program(&self, pool: &str, request: &BatchRequest<'_>) -> Result<()> {
        let category = request.category();

        // Uses tempfile::NamedTempFile so the script path is unpredictable.
        let mut script = tempfile::Builder::new()
            .prefix("pve-autosnap-")
            .suffix(".lua")
            .tempfile()
            .context("creating temp file for channel program")?;
        script
            .write_all(source(category).as_bytes())
            .context("writing channel program to temp file")?;
        script.flush().context("flushing channel program")?;

        let script_path = script.path().to_string_lossy().into_owned();
        let operands = program_args(request, &self.owner_property);

        let mut args: Vec<&str> = vec!["program", pool, &script_path];
        args.extend(operands.iter().map(String::as_str));

        run_command(&self.zfs_binary, &args)
            .await
            .with_context(|| format!("channel program {} on pool {}", category, pool))?;

        // script is removed when dropped
        Ok(())
    }
}

impl StorageBackend for Zfs {
    /// Runs: `zpool list -H -o name`
    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<String>> {
        let output = run_command_output(&self.zpool_binary, &["list", "-H", "-o", "name"])
            .await
            .context("failed to list pools")?;
        Ok(parse_pool_list(&output))
    }

    /// Runs: `zfs list -H -p -o name,{nosnap},{owner} -r {pool}`
    #[instrument(skip(self))]
    async fn list_datasets(&self, pool: &str) -> Result<Vec<Dataset>> {
        let columns = format!("name,{},{}", self.nosnap_property, self.owner_property);
        let output = run_command_output(
            &self.zfs_binary,
            &["list", "-H", "-p", "-o", &columns, "-r", pool],
        )
        .await
        .with_context(|| format!("failed to list datasets of {}", pool))?;
        parse_dataset_list(&output, &self.nosnap_value)
    }

    /// Runs: `zfs list -H -p -o name,creation -t snapshot -d 1 {dataset}`
    #[instrument(skip(self))]
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<Snapshot>> {
        let output = run_command_output(
            &self.zfs_binary,
            &[
                "list", "-H", "-p", "-o", "name,creation", "-t", "snapshot", "-d", "1", dataset,
            ],
        )
        .await
        .with_context(|| format!("failed to list snapshots of {}", dataset))?;
        parse_snapshot_list(&output)
    }
}

impl BatchExecutor for Zfs {
    #[instrument(skip(self, request), fields(category = %request.category(), operands = request.len()))]
    async fn apply_batch(&self, pool: &str, request: BatchRequest<'_>) -> Result<()> {
        if request.is_empty() {
            return Ok(());
        }
        self.run_program(pool, &request).await
    }
}

/// Run a command and check for success.
async fn run_command(binary: &Path, args: &[&str]) -> Result<()> {
    run_command_output(binary, args).await.map(|_| ())
}

/// Run a command and return its stdout.
async fn run_command_output(binary: &Path, args: &[&str]) -> Result<String> {
    debug!(binary = %binary.display(), args = ?args, "running command");

    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to execute {}", binary.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} {} failed: {}",
            binary.display(),
            args.first().unwrap_or(&""),
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parse `zpool list -H -o name` output.
pub(crate) fn parse_pool_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Parse tab-separated `zfs list` output into datasets.
///
/// Expected format per line: name\tnosnap\towner
pub(crate) fn parse_dataset_list(output: &str, nosnap_value: &str) -> Result<Vec<Dataset>> {
    let mut datasets = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 3 {
            bail!("unexpected zfs list output: {}", line);
        }
        datasets.push(Dataset {
            name: parts[0].to_string(),
            excluded_from_snapshots: parts[1].trim() == nosnap_value,
            owner: OwnerMarker::from_property(parts[2]),
        });
    }
    Ok(datasets)
}

/// Parse tab-separated `zfs list -t snapshot` output.
///
/// Expected format per line: full_name\tcreation
pub(crate) fn parse_snapshot_list(output: &str) -> Result<Vec<Snapshot>> {
    let mut snapshots = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let Some((name, creation)) = line.split_once('\t') else {
            bail!("unexpected zfs list output: {}", line);
        };
        if !name.contains('@') {
            bail!("not a snapshot name: {}", name);
        }
        let creation = creation
            .trim()
            .parse::<i64>()
            .with_context(|| format!("bad creation time for {}: {:?}", name, creation))?;
        snapshots.push(Snapshot {
            name: name.to_string(),
            creation,
        });
    }
    Ok(snapshots)
}
