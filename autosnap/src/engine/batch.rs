//! Per-pool accumulator of decided operations and its submission contract.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use super::EngineError;
use crate::storage::OwnerMarker;

/// One kind of storage mutation. Each kind is submitted as its own atomic
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BatchCategory {
    CreateSnapshots,
    DestroySnapshots,
    MarkOwnerHere,
    MarkOwnerStopped,
}

impl BatchCategory {
    /// Submission order.
    pub const ALL: [BatchCategory; 4] = [
        BatchCategory::CreateSnapshots,
        BatchCategory::DestroySnapshots,
        BatchCategory::MarkOwnerHere,
        BatchCategory::MarkOwnerStopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BatchCategory::CreateSnapshots => "create-snapshots",
            BatchCategory::DestroySnapshots => "destroy-snapshots",
            BatchCategory::MarkOwnerHere => "mark-owner-here",
            BatchCategory::MarkOwnerStopped => "mark-owner-stopped",
        }
    }
}

impl fmt::Display for BatchCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dataset whose owner marker is to be rewritten, together with the
/// marker value observed when the decision was made.
///
/// The executor only rewrites the marker if it still holds `observed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkOperand {
    pub dataset: String,
    #[serde(serialize_with = "serialize_marker")]
    pub observed: OwnerMarker,
}

fn serialize_marker<S: serde::Serializer>(marker: &OwnerMarker, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(marker.as_property())
}

/// One atomic request handed to the executor.
#[derive(Debug, Clone, Copy)]
pub enum BatchRequest<'a> {
    CreateSnapshots(&'a [String]),
    DestroySnapshots(&'a [String]),
    /// Rewrite owner markers to `value`.
    SetOwner {
        category: BatchCategory,
        value: &'a str,
        marks: &'a [MarkOperand],
    },
}

impl BatchRequest<'_> {
    pub fn category(&self) -> BatchCategory {
        match self {
            BatchRequest::CreateSnapshots(_) => BatchCategory::CreateSnapshots,
            BatchRequest::DestroySnapshots(_) => BatchCategory::DestroySnapshots,
            BatchRequest::SetOwner { category, .. } => *category,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BatchRequest::CreateSnapshots(names) | BatchRequest::DestroySnapshots(names) => {
                names.len()
            }
            BatchRequest::SetOwner { marks, .. } => marks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies one category of mutations atomically: either every operand takes
/// effect or none does.
#[allow(async_fn_in_trait)]
pub trait BatchExecutor {
    async fn apply_batch(&self, pool: &str, request: BatchRequest<'_>) -> anyhow::Result<()>;
}

/// Everything one pass decided for one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingBatch {
    pub pool: String,
    /// Node id written by mark-owner-here.
    pub node: String,
    pub create_snapshots: Vec<String>,
    pub destroy_snapshots: Vec<String>,
    pub mark_owner_here: Vec<MarkOperand>,
    pub mark_owner_stopped: Vec<MarkOperand>,
}

/// Outcome of [`PendingBatch::submit`].
#[derive(Debug, Default)]
pub struct SubmitReport {
    /// Categories applied, with their operand counts.
    pub applied: Vec<(BatchCategory, usize)>,
    pub failures: Vec<EngineError>,
}

impl SubmitReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl PendingBatch {
    pub fn new(pool: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            node: node.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.create_snapshots.is_empty()
            && self.destroy_snapshots.is_empty()
            && self.mark_owner_here.is_empty()
            && self.mark_owner_stopped.is_empty()
    }

    /// The request for one category, or `None` when it has no operands.
    pub fn request(&self, category: BatchCategory) -> Option<BatchRequest<'_>> {
        let request = match category {
            BatchCategory::CreateSnapshots => BatchRequest::CreateSnapshots(&self.create_snapshots),
            BatchCategory::DestroySnapshots => {
                BatchRequest::DestroySnapshots(&self.destroy_snapshots)
            }
            BatchCategory::MarkOwnerHere => BatchRequest::SetOwner {
                category,
                value: &self.node,
                marks: &self.mark_owner_here,
            },
            BatchCategory::MarkOwnerStopped => BatchRequest::SetOwner {
                category,
                value: OwnerMarker::STOPPED,
                marks: &self.mark_owner_stopped,
            },
        };
        (!request.is_empty()).then_some(request)
    }

    /// Submit each non-empty category as an independent atomic request.
    ///
    /// Creates go out in rounds (see [`snapshot_rounds`]); a failed round
    /// stops the rounds after it. A failed category is logged and recorded;
    /// the remaining categories are still submitted.
    pub async fn submit<E: BatchExecutor>(&self, executor: &E) -> SubmitReport {
        let mut report = SubmitReport::default();
        for category in BatchCategory::ALL {
            if category == BatchCategory::CreateSnapshots {
                for round in snapshot_rounds(&self.create_snapshots) {
                    let request = BatchRequest::CreateSnapshots(&round);
                    if !self.submit_one(executor, request, &mut report).await {
                        break;
                    }
                }
                continue;
            }
            if let Some(request) = self.request(category) {
                self.submit_one(executor, request, &mut report).await;
            }
        }
        report
    }

    async fn submit_one<E: BatchExecutor>(
        &self,
        executor: &E,
        request: BatchRequest<'_>,
        report: &mut SubmitReport,
    ) -> bool {
        let category = request.category();
        let operands = request.len();
        match executor.apply_batch(&self.pool, request).await {
            Ok(()) => {
                info!(pool = %self.pool, category = %category, operands, "batch applied");
                report.applied.push((category, operands));
                true
            }
            Err(e) => {
                warn!(
                    pool = %self.pool,
                    category = %category,
                    operands,
                    error = %format!("{:#}", e),
                    "batch failed, no operand in this request was applied"
                );
                report.failures.push(EngineError::Application {
                    pool: self.pool.clone(),
                    category,
                    source: e,
                });
                false
            }
        }
    }
}

/// Split snapshot names into rounds holding at most one snapshot per dataset.
///
/// ZFS refuses a second snapshot of the same dataset within one transaction
/// group, and a channel program runs in a single one. Round `n` holds the
/// `n`th snapshot of every dataset, in batch order.
pub fn snapshot_rounds(names: &[String]) -> Vec<Vec<String>> {
    let mut rounds: Vec<Vec<String>> = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for name in names {
        let dataset = name.split_once('@').map(|(ds, _)| ds).unwrap_or(name);
        let slot = seen.entry(dataset).or_insert(0);
        if *slot == rounds.len() {
            rounds.push(Vec::new());
        }
        rounds[*slot].push(name.clone());
        *slot += 1;
    }
    rounds
}
