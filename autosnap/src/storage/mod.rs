pub mod program;
pub mod zfs;

use std::fmt;

use anyhow::Result;

pub use zfs::Zfs;

/// Who a dataset's owner marker says is running it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerMarker {
    /// Property never set (`-`).
    Unset,
    /// Released at a stop boundary.
    Stopped,
    /// Claimed by the named cluster node.
    Node(String),
}

impl OwnerMarker {
    pub const UNSET: &'static str = "-";
    pub const STOPPED: &'static str = "stopped";

    /// Parse the user property value as printed by `zfs list -H`.
    pub fn from_property(value: &str) -> Self {
        match value.trim() {
            "" | Self::UNSET => OwnerMarker::Unset,
            Self::STOPPED => OwnerMarker::Stopped,
            node => OwnerMarker::Node(node.to_string()),
        }
    }

    /// The property value this marker is stored as.
    pub fn as_property(&self) -> &str {
        match self {
            OwnerMarker::Unset => Self::UNSET,
            OwnerMarker::Stopped => Self::STOPPED,
            OwnerMarker::Node(node) => node,
        }
    }

    pub fn is_node(&self, node: &str) -> bool {
        matches!(self, OwnerMarker::Node(n) if n == node)
    }
}

impl fmt::Display for OwnerMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_property())
    }
}

/// A dataset under a storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Full dataset name (e.g. "rpool/data/vm-100-disk-0")
    pub name: String,
    /// Skipped by the retention scheduler, still reconciled.
    pub excluded_from_snapshots: bool,
    pub owner: OwnerMarker,
}

/// A snapshot of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Full snapshot name (e.g. "rpool/data/vm-100-disk-0@autosnap_2023-10-19_10:00:00_hourly")
    pub name: String,
    /// Creation timestamp (seconds since epoch)
    pub creation: i64,
}

/// Read side of the storage backend.
#[allow(async_fn_in_trait)]
pub trait StorageBackend {
    async fn list_pools(&self) -> Result<Vec<String>>;

    async fn list_datasets(&self, pool: &str) -> Result<Vec<Dataset>>;

    /// Snapshots of exactly `dataset`, in any order.
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<Snapshot>>;
}
