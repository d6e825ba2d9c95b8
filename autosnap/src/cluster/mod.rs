//! Cluster workload enumeration through `pvesh`.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Run state reported for a VM or container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum WorkloadStatus {
    Running,
    Stopped,
    /// Anything else pvesh reports (e.g. "paused", "unknown").
    Other(String),
}

impl From<String> for WorkloadStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "running" => WorkloadStatus::Running,
            "stopped" => WorkloadStatus::Stopped,
            _ => WorkloadStatus::Other(value),
        }
    }
}

impl WorkloadStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkloadStatus::Running)
    }
}

/// A VM (`qemu`) or container (`lxc`) as listed by `/cluster/resources`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Workload {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    /// "qemu" or "lxc"
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub status: WorkloadStatus,
    /// Node the workload is currently placed on.
    pub node: String,
}

/// Source of the cluster's workload list.
#[allow(async_fn_in_trait)]
pub trait WorkloadSource {
    async fn list_workloads(&self) -> Result<Vec<Workload>>;
}

/// `pvesh` CLI wrapper.
#[derive(Debug, Clone)]
pub struct Pvesh {
    binary: PathBuf,
}

impl Pvesh {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

impl WorkloadSource for Pvesh {
    /// Runs: `pvesh get /cluster/resources --type vm --output-format json`
    #[instrument(skip(self))]
    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let args = [
            "get",
            "/cluster/resources",
            "--type",
            "vm",
            "--output-format",
            "json",
        ];
        debug!(binary = %self.binary.display(), args = ?args, "running pvesh command");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("pvesh get /cluster/resources failed: {}", stderr.trim());
        }

        parse_resources(&output.stdout)
    }
}

/// Parse the JSON array printed by `pvesh get /cluster/resources --type vm`.
pub(crate) fn parse_resources(json: &[u8]) -> Result<Vec<Workload>> {
    if json.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(json).context("failed to parse pvesh resource list")
}
