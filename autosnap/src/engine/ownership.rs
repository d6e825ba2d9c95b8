//! Owner-marker reconciliation.
//!
//! A dataset's marker records the node running its workload. When the local
//! view disagrees with the marker the dataset is either released (closing
//! snapshot plus `stopped` marker) or claimed for this node.

use std::collections::HashSet;

use tracing::debug;

use super::batch::{MarkOperand, PendingBatch};
use super::matcher::workload_id;
use super::retention::Tier;
use super::RunClock;
use crate::storage::{Dataset, OwnerMarker};

/// Marker transitions decided for one pool.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Not running here, marker says here or unset.
    pub pending_stop: Vec<Dataset>,
    /// Running here, marker says somewhere else or nowhere.
    pub pending_start: Vec<Dataset>,
}

/// Compute stop/start transitions for `all` given the datasets of locally
/// running workloads.
pub fn reconcile(all: &[Dataset], locally_running: &[Dataset], local_node: &str) -> Reconciliation {
    let running: HashSet<&str> = locally_running.iter().map(|d| d.name.as_str()).collect();
    let mut out = Reconciliation::default();

    for ds in all {
        if running.contains(ds.name.as_str()) {
            if !ds.owner.is_node(local_node) {
                debug!(dataset = %ds.name, vmid = ?workload_id(&ds.name), owner = %ds.owner, "claiming dataset");
                out.pending_start.push(ds.clone());
            }
        } else if ds.owner.is_node(local_node) || ds.owner == OwnerMarker::Unset {
            debug!(dataset = %ds.name, vmid = ?workload_id(&ds.name), owner = %ds.owner, "releasing dataset");
            out.pending_stop.push(ds.clone());
        }
    }
    out
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.pending_stop.is_empty() && self.pending_start.is_empty()
    }

    /// Append the closing snapshots and marker rewrites to `batch`.
    pub fn apply_to(&self, batch: &mut PendingBatch, clock: &RunClock) {
        for ds in &self.pending_stop {
            batch
                .create_snapshots
                .push(Tier::Stopped.snapshot_name(&ds.name, clock));
            batch.mark_owner_stopped.push(MarkOperand {
                dataset: ds.name.clone(),
                observed: ds.owner.clone(),
            });
        }
        for ds in &self.pending_start {
            batch.mark_owner_here.push(MarkOperand {
                dataset: ds.name.clone(),
                observed: ds.owner.clone(),
            });
        }
    }
}
