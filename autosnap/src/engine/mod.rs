//! Reconciliation-and-retention engine.
//!
//! [`plan_pool`] is the pure decision function: given one pool's datasets,
//! their snapshots and the cluster's workloads it returns the
//! [`PendingBatch`] to apply. [`run`] drives it across every pool against
//! the real collaborators.

pub mod batch;
pub mod matcher;
pub mod ownership;
pub mod retention;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeZone};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::cluster::{Workload, WorkloadSource};
use crate::storage::{Dataset, Snapshot, StorageBackend};

pub use batch::{BatchCategory, BatchExecutor, BatchRequest, MarkOperand, PendingBatch, SubmitReport};
pub use retention::{Tier, TierPolicies, TierPolicy, TierTokenError};

/// Human-readable timestamp embedded in snapshot names.
pub const LABEL_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// The instant a run is evaluated at, fixed once per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunClock {
    /// Seconds since epoch.
    pub epoch: i64,
    /// Local time formatted with [`LABEL_FORMAT`].
    pub label: String,
}

impl RunClock {
    pub fn now() -> Self {
        Self::at(&chrono::Local::now())
    }

    pub fn at<Tz: TimeZone>(time: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self {
            epoch: time.timestamp(),
            label: time.format(LABEL_FORMAT).to_string(),
        }
    }
}

/// Immutable inputs shared by every decision in one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// This node's id, as written into owner markers.
    pub node: String,
    pub clock: RunClock,
    pub policies: TierPolicies,
    /// Seconds before a tier's interval elapses at which creation already triggers.
    pub grace_secs: i64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid tier policy: {0}")]
    Configuration(#[from] TierTokenError),

    #[error("failed to list {what} for {scope}")]
    Collection {
        what: &'static str,
        scope: String,
        source: anyhow::Error,
    },

    #[error("{category} batch failed on pool {pool}")]
    Application {
        pool: String,
        category: BatchCategory,
        source: anyhow::Error,
    },
}

/// Datasets of one pool split by the state of their workloads on this node.
#[derive(Debug, Default, Clone)]
pub struct Triage {
    /// Datasets of any workload on this node.
    pub all: Vec<Dataset>,
    /// Datasets of workloads running on this node.
    pub running: Vec<Dataset>,
}

impl Triage {
    pub fn new(datasets: &[Dataset], workloads: &[Workload], node: &str) -> Self {
        let local: Vec<&Workload> = workloads.iter().filter(|w| w.node == node).collect();
        let all_ids: Vec<u32> = local.iter().map(|w| w.vmid).collect();
        let running_ids: Vec<u32> = local
            .iter()
            .filter(|w| w.status.is_running())
            .map(|w| w.vmid)
            .collect();

        let all = matcher::match_datasets(datasets, &all_ids);
        let running = matcher::match_datasets(&all, &running_ids);
        Self { all, running }
    }

    /// Running datasets the retention scheduler looks at.
    pub fn retention_targets(&self) -> impl Iterator<Item = &Dataset> {
        self.running.iter().filter(|ds| !ds.excluded_from_snapshots)
    }
}

/// Everything collected for one pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolInput<'a> {
    pub pool: &'a str,
    pub datasets: &'a [Dataset],
    pub snapshots_by_dataset: &'a HashMap<String, Vec<Snapshot>>,
    /// Cluster-wide workloads; filtered to this node here.
    pub workloads: &'a [Workload],
}

/// Decide every operation for one pool.
pub fn plan_pool(input: PoolInput<'_>, ctx: &RunContext) -> PendingBatch {
    let triage = Triage::new(input.datasets, input.workloads, &ctx.node);
    let mut batch = PendingBatch::new(input.pool, ctx.node.as_str());

    let reconciliation = ownership::reconcile(&triage.all, &triage.running, &ctx.node);
    if reconciliation.is_empty() {
        debug!(pool = %input.pool, "owner markers already match placement");
    } else {
        reconciliation.apply_to(&mut batch, &ctx.clock);
    }

    for ds in triage.retention_targets() {
        let snapshots = input
            .snapshots_by_dataset
            .get(&ds.name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        retention::schedule_dataset(
            &mut batch,
            &ds.name,
            snapshots,
            &ctx.policies,
            &ctx.clock,
            ctx.grace_secs,
        );
    }
    batch
}

/// Knobs for [`run`] that do not affect decisions.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Plan only; submit nothing.
    pub dry_run: bool,
    /// Restrict the run to these pools. Empty means every pool.
    pub pools: Vec<String>,
}

/// Result of processing one pool.
#[derive(Debug)]
pub struct PoolReport {
    pub batch: PendingBatch,
    /// `None` on a dry run.
    pub submit: Option<SubmitReport>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub pools: Vec<PoolReport>,
}

impl RunReport {
    /// Categories that failed to apply across all pools.
    pub fn failures(&self) -> impl Iterator<Item = &EngineError> {
        self.pools
            .iter()
            .filter_map(|p| p.submit.as_ref())
            .flat_map(|s| s.failures.iter())
    }
}

/// Collect a pool's datasets and the snapshots the scheduler needs.
#[instrument(skip(storage, workloads, ctx))]
async fn collect_pool<S: StorageBackend>(
    storage: &S,
    pool: &str,
    workloads: &[Workload],
    ctx: &RunContext,
) -> Result<(Vec<Dataset>, HashMap<String, Vec<Snapshot>>), EngineError> {
    let datasets = storage
        .list_datasets(pool)
        .await
        .map_err(|source| EngineError::Collection {
            what: "datasets",
            scope: format!("pool {}", pool),
            source,
        })?;

    let triage = Triage::new(&datasets, workloads, &ctx.node);
    let mut snapshots = HashMap::new();
    for ds in triage.retention_targets() {
        let list = storage
            .list_snapshots(&ds.name)
            .await
            .map_err(|source| EngineError::Collection {
                what: "snapshots",
                scope: format!("dataset {}", ds.name),
                source,
            })?;
        debug!(dataset = %ds.name, count = list.len(), "collected snapshots");
        snapshots.insert(ds.name.clone(), list);
    }
    Ok((datasets, snapshots))
}

/// One full pass: every pool in turn, each planned then submitted.
///
/// Listing failures abort the run; pools already submitted stay applied.
/// Batch failures are recorded in the report and do not stop the run.
pub async fn run<S, W>(
    storage: &S,
    workload_source: &W,
    ctx: &RunContext,
    options: &RunOptions,
) -> Result<RunReport, EngineError>
where
    S: StorageBackend + BatchExecutor,
    W: WorkloadSource,
{
    let workloads = workload_source
        .list_workloads()
        .await
        .map_err(|source| EngineError::Collection {
            what: "workloads",
            scope: "cluster".to_string(),
            source,
        })?;

    let mut pools = storage
        .list_pools()
        .await
        .map_err(|source| EngineError::Collection {
            what: "pools",
            scope: format!("node {}", ctx.node),
            source,
        })?;
    if !options.pools.is_empty() {
        pools.retain(|p| options.pools.contains(p));
    }

    info!(
        node = %ctx.node,
        pools = pools.len(),
        workloads = workloads.iter().filter(|w| w.node == ctx.node).count(),
        dry_run = options.dry_run,
        "starting snapshot pass"
    );

    let mut report = RunReport::default();
    for pool in &pools {
        let (datasets, snapshots) = collect_pool(storage, pool, &workloads, ctx).await?;
        let batch = plan_pool(
            PoolInput {
                pool,
                datasets: &datasets,
                snapshots_by_dataset: &snapshots,
                workloads: &workloads,
            },
            ctx,
        );

        info!(
            pool = %pool,
            create = batch.create_snapshots.len(),
            destroy = batch.destroy_snapshots.len(),
            mark_here = batch.mark_owner_here.len(),
            mark_stopped = batch.mark_owner_stopped.len(),
            "pool planned"
        );

        let submit = if options.dry_run {
            None
        } else {
            Some(batch.submit(storage).await)
        };
        report.pools.push(PoolReport { batch, submit });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WorkloadStatus;
    use crate::storage::OwnerMarker;
    use std::sync::Mutex;

    const NODE: &str = "pve1";

    fn ctx(epoch: i64, tokens: &str) -> RunContext {
        RunContext {
            node: NODE.to_string(),
            clock: RunClock {
                epoch,
                label: format!("2024-06-01_12:00:{:02}", epoch % 60),
            },
            policies: tokens.parse().unwrap(),
            grace_secs: 0,
        }
    }

    fn workload(vmid: u32, status: &str, node: &str) -> Workload {
        Workload {
            vmid,
            name: None,
            kind: None,
            status: WorkloadStatus::from(status.to_string()),
            node: node.to_string(),
        }
    }

    fn ds(name: &str, owner: &str) -> Dataset {
        Dataset {
            name: name.to_string(),
            excluded_from_snapshots: false,
            owner: OwnerMarker::from_property(owner),
        }
    }

    #[derive(Default)]
    struct FakeState {
        pools: Vec<String>,
        datasets: HashMap<String, Vec<Dataset>>,
        snapshots: HashMap<String, Vec<Snapshot>>,
        fail_listing: Option<String>,
        fail_apply: Option<(String, BatchCategory)>,
        applied: Vec<(String, BatchCategory)>,
    }

    /// In-memory pool that applies batches the way the channel programs do.
    struct FakeCluster {
        now: i64,
        workloads: Vec<Workload>,
        state: Mutex<FakeState>,
    }

    impl FakeCluster {
        fn new(now: i64, workloads: Vec<Workload>) -> Self {
            Self {
                now,
                workloads,
                state: Mutex::new(FakeState::default()),
            }
        }

        fn add_pool(&self, pool: &str, datasets: Vec<Dataset>) {
            let mut state = self.state.lock().unwrap();
            state.pools.push(pool.to_string());
            state.datasets.insert(pool.to_string(), datasets);
        }

        fn add_snapshot(&self, name: &str, creation: i64) {
            let dataset = name.split_once('@').unwrap().0.to_string();
            let mut state = self.state.lock().unwrap();
            state.snapshots.entry(dataset).or_default().push(Snapshot {
                name: name.to_string(),
                creation,
            });
        }

        fn owner(&self, pool: &str, dataset: &str) -> OwnerMarker {
            let state = self.state.lock().unwrap();
            state.datasets[pool]
                .iter()
                .find(|d| d.name == dataset)
                .unwrap()
                .owner
                .clone()
        }

        fn snapshot_names(&self, dataset: &str) -> Vec<String> {
            let state = self.state.lock().unwrap();
            state
                .snapshots
                .get(dataset)
                .map(|v| v.iter().map(|s| s.name.clone()).collect())
                .unwrap_or_default()
        }
    }

    impl WorkloadSource for FakeCluster {
        async fn list_workloads(&self) -> anyhow::Result<Vec<Workload>> {
            Ok(self.workloads.clone())
        }
    }

    impl StorageBackend for FakeCluster {
        async fn list_pools(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.state.lock().unwrap().pools.clone())
        }

        async fn list_datasets(&self, pool: &str) -> anyhow::Result<Vec<Dataset>> {
            let state = self.state.lock().unwrap();
            if state.fail_listing.as_deref() == Some(pool) {
                anyhow::bail!("zfs list failed: pool I/O is currently suspended");
            }
            Ok(state.datasets.get(pool).cloned().unwrap_or_default())
        }

        async fn list_snapshots(&self, dataset: &str) -> anyhow::Result<Vec<Snapshot>> {
            let state = self.state.lock().unwrap();
            Ok(state.snapshots.get(dataset).cloned().unwrap_or_default())
        }
    }

    impl BatchExecutor for FakeCluster {
        async fn apply_batch(&self, pool: &str, request: BatchRequest<'_>) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.applied.push((pool.to_string(), request.category()));
            if state.fail_apply == Some((pool.to_string(), request.category())) {
                anyhow::bail!("channel program failed: out of space");
            }
            match request {
                BatchRequest::CreateSnapshots(names) => {
                    let mut datasets = std::collections::HashSet::new();
                    for name in names {
                        let dataset = name.split_once('@').unwrap().0;
                        anyhow::ensure!(
                            datasets.insert(dataset),
                            "two snapshots of {} in one transaction group",
                            dataset
                        );
                    }
                    for name in names {
                        let dataset = name.split_once('@').unwrap().0.to_string();
                        state.snapshots.entry(dataset).or_default().push(Snapshot {
                            name: name.clone(),
                            creation: self.now,
                        });
                    }
                }
                BatchRequest::DestroySnapshots(names) => {
                    for list in state.snapshots.values_mut() {
                        list.retain(|s| !names.contains(&s.name));
                    }
                }
                BatchRequest::SetOwner { value, marks, .. } => {
                    let datasets = state.datasets.get_mut(pool).unwrap();
                    for mark in marks {
                        let ds = datasets.iter_mut().find(|d| d.name == mark.dataset).unwrap();
                        anyhow::ensure!(ds.owner == mark.observed, "marker moved");
                    }
                    for mark in marks {
                        let ds = datasets.iter_mut().find(|d| d.name == mark.dataset).unwrap();
                        ds.owner = OwnerMarker::from_property(value);
                    }
                }
            }
            Ok(())
        }
    }

    fn sample_cluster(now: i64) -> FakeCluster {
        let cluster = FakeCluster::new(
            now,
            vec![
                workload(100, "running", NODE),
                workload(101, "stopped", NODE),
                workload(102, "running", NODE),
                workload(200, "running", "pve2"),
            ],
        );
        let mut excluded = ds("rpool/data/subvol-102-disk-0", NODE);
        excluded.excluded_from_snapshots = true;
        cluster.add_pool(
            "rpool",
            vec![
                ds("rpool", "-"),
                ds("rpool/data", "-"),
                ds("rpool/data/vm-100-disk-0", "-"),
                ds("rpool/data/vm-101-disk-0", NODE),
                excluded,
                ds("rpool/data/vm-200-disk-0", "pve2"),
            ],
        );
        cluster
    }

    #[test]
    fn triage_uses_only_local_workloads() {
        let datasets = vec![
            ds("rpool/data/vm-100-disk-0", "-"),
            ds("rpool/data/vm-101-disk-0", "-"),
            ds("rpool/data/vm-200-disk-0", "-"),
        ];
        let workloads = vec![
            workload(100, "running", NODE),
            workload(101, "stopped", NODE),
            workload(200, "running", "pve2"),
        ];
        let t = Triage::new(&datasets, &workloads, NODE);
        assert_eq!(t.all.len(), 2);
        assert_eq!(t.running.len(), 1);
        assert_eq!(t.running[0].name, "rpool/data/vm-100-disk-0");
    }

    #[test]
    fn plan_pool_combines_reconciliation_and_retention() {
        let cluster = sample_cluster(1_717_243_200);
        let state = cluster.state.lock().unwrap();
        let snapshots = HashMap::new();
        let ctx = ctx(1_717_243_200, "h2 d1");
        let batch = plan_pool(
            PoolInput {
                pool: "rpool",
                datasets: &state.datasets["rpool"],
                snapshots_by_dataset: &snapshots,
                workloads: &cluster.workloads,
            },
            &ctx,
        );

        assert_eq!(batch.pool, "rpool");
        assert_eq!(batch.node, NODE);
        // vm-101 released with a closing snapshot; vm-100 hourly + daily.
        assert_eq!(
            batch.create_snapshots,
            vec![
                "rpool/data/vm-101-disk-0@autosnap_2024-06-01_12:00:00_stopped".to_string(),
                "rpool/data/vm-100-disk-0@autosnap_2024-06-01_12:00:00_daily".to_string(),
                "rpool/data/vm-100-disk-0@autosnap_2024-06-01_12:00:00_hourly".to_string(),
            ]
        );
        assert!(batch.destroy_snapshots.is_empty());
        let here: Vec<&str> = batch.mark_owner_here.iter().map(|m| m.dataset.as_str()).collect();
        assert_eq!(here, vec!["rpool/data/vm-100-disk-0"]);
        let stopped: Vec<&str> = batch
            .mark_owner_stopped
            .iter()
            .map(|m| m.dataset.as_str())
            .collect();
        assert_eq!(stopped, vec!["rpool/data/vm-101-disk-0"]);
    }

    #[test]
    fn create_and_destroy_never_overlap() {
        let cluster = sample_cluster(1_717_243_200);
        let mut snapshots = HashMap::new();
        snapshots.insert(
            "rpool/data/vm-100-disk-0".to_string(),
            (0..6)
                .map(|i| Snapshot {
                    name: format!("rpool/data/vm-100-disk-0@autosnap_2024-06-01_11:0{}:00_frequently", i),
                    creation: 1_717_243_200 - 600 + i * 60,
                })
                .collect::<Vec<_>>(),
        );
        let state = cluster.state.lock().unwrap();
        let batch = plan_pool(
            PoolInput {
                pool: "rpool",
                datasets: &state.datasets["rpool"],
                snapshots_by_dataset: &snapshots,
                workloads: &cluster.workloads,
            },
            &ctx(1_717_243_200, "f2"),
        );
        assert_eq!(batch.destroy_snapshots.len(), 5);
        for name in &batch.create_snapshots {
            assert!(!batch.destroy_snapshots.contains(name));
        }
    }

    #[tokio::test]
    async fn run_applies_and_second_run_is_empty() {
        let now = 1_717_243_200;
        let cluster = sample_cluster(now);
        cluster.add_snapshot("rpool/data/vm-100-disk-0@autosnap_2020-01-01_00:00:00_yearly", 1_577_836_800);
        let ctx = ctx(now, "f3 h24 d7");

        let first = run(&cluster, &cluster, &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(first.pools.len(), 1);
        assert_eq!(first.failures().count(), 0);
        assert!(!first.pools[0].batch.is_empty());

        assert_eq!(cluster.owner("rpool", "rpool/data/vm-100-disk-0"), OwnerMarker::Node(NODE.into()));
        assert_eq!(cluster.owner("rpool", "rpool/data/vm-101-disk-0"), OwnerMarker::Stopped);
        // Yearly is not configured, so the old yearly snapshot is gone.
        let names = cluster.snapshot_names("rpool/data/vm-100-disk-0");
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| !n.ends_with("_yearly")));
        // Excluded dataset gets no retention snapshots.
        assert!(cluster.snapshot_names("rpool/data/subvol-102-disk-0").is_empty());

        let second = run(&cluster, &cluster, &ctx, &RunOptions::default()).await.unwrap();
        assert!(second.pools[0].batch.is_empty(), "{:?}", second.pools[0].batch);
    }

    #[tokio::test]
    async fn dry_run_submits_nothing() {
        let cluster = sample_cluster(1_717_243_200);
        let options = RunOptions {
            dry_run: true,
            pools: Vec::new(),
        };
        let report = run(&cluster, &cluster, &ctx(1_717_243_200, "h1"), &options).await.unwrap();
        assert!(report.pools[0].submit.is_none());
        assert!(!report.pools[0].batch.is_empty());
        assert!(cluster.state.lock().unwrap().applied.is_empty());
    }

    #[tokio::test]
    async fn pool_filter_restricts_run() {
        let cluster = sample_cluster(1_717_243_200);
        cluster.add_pool("hdd", vec![ds("hdd/vm-100-disk-1", "-")]);
        let options = RunOptions {
            dry_run: true,
            pools: vec!["hdd".to_string()],
        };
        let report = run(&cluster, &cluster, &ctx(1_717_243_200, "h1"), &options).await.unwrap();
        assert_eq!(report.pools.len(), 1);
        assert_eq!(report.pools[0].batch.pool, "hdd");
    }

    #[tokio::test]
    async fn listing_failure_aborts_after_earlier_pools() {
        let cluster = sample_cluster(1_717_243_200);
        cluster.add_pool("hdd", vec![]);
        cluster.state.lock().unwrap().fail_listing = Some("hdd".to_string());

        let err = run(&cluster, &cluster, &ctx(1_717_243_200, "h1"), &RunOptions::default())
            .await
            .unwrap_err();
        match err {
            EngineError::Collection { what, scope, .. } => {
                assert_eq!(what, "datasets");
                assert_eq!(scope, "pool hdd");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // rpool was processed first and its batch stays applied.
        assert_eq!(cluster.owner("rpool", "rpool/data/vm-101-disk-0"), OwnerMarker::Stopped);
    }

    #[tokio::test]
    async fn batch_failure_does_not_stop_later_pools() {
        let now = 1_717_243_200;
        let cluster = sample_cluster(now);
        cluster.add_pool("hdd", vec![ds("hdd/vm-102-disk-1", "-")]);
        cluster.state.lock().unwrap().fail_apply =
            Some(("rpool".to_string(), BatchCategory::MarkOwnerHere));

        let report = run(&cluster, &cluster, &ctx(now, "h1"), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(report.pools.len(), 2);
        assert_eq!(report.failures().count(), 1);
        match report.failures().next() {
            Some(EngineError::Application { pool, category, .. }) => {
                assert_eq!(pool, "rpool");
                assert_eq!(*category, BatchCategory::MarkOwnerHere);
            }
            other => panic!("unexpected failure: {:?}", other),
        }

        let hdd = report.pools[1].submit.as_ref().unwrap();
        assert!(hdd.is_success());
        assert!(!hdd.applied.is_empty());
        assert_eq!(cluster.owner("hdd", "hdd/vm-102-disk-1"), OwnerMarker::Node(NODE.into()));
        // rpool's other categories still went through.
        assert_eq!(cluster.owner("rpool", "rpool/data/vm-101-disk-0"), OwnerMarker::Stopped);
        assert_eq!(cluster.owner("rpool", "rpool/data/vm-100-disk-0"), OwnerMarker::Unset);
    }

    #[tokio::test]
    async fn moved_marker_fails_only_its_category() {
        let cluster = sample_cluster(1_717_243_200);
        let ctx = ctx(1_717_243_200, "h1");
        {
            let mut state = cluster.state.lock().unwrap();
            let datasets = state.datasets.get_mut("rpool").unwrap();
            // A dataset we will plan to claim, whose marker changes mid-flight.
            datasets.push(ds("rpool/data/vm-100-disk-9", "-"));
        }
        let state_snapshot = cluster.state.lock().unwrap().datasets["rpool"].clone();
        let snapshots = HashMap::new();
        let batch = plan_pool(
            PoolInput {
                pool: "rpool",
                datasets: &state_snapshot,
                snapshots_by_dataset: &snapshots,
                workloads: &cluster.workloads,
            },
            &ctx,
        );
        {
            let mut state = cluster.state.lock().unwrap();
            let datasets = state.datasets.get_mut("rpool").unwrap();
            datasets.iter_mut().find(|d| d.name == "rpool/data/vm-100-disk-9").unwrap().owner =
                OwnerMarker::Node("pve2".into());
        }
        let report = batch.submit(&cluster).await;
        assert_eq!(report.failures.len(), 1);
        assert!(report
            .applied
            .iter()
            .any(|(c, _)| *c == BatchCategory::CreateSnapshots));
        // The whole mark-here request was refused, including vm-100-disk-0.
        assert_eq!(cluster.owner("rpool", "rpool/data/vm-100-disk-0"), OwnerMarker::Unset);
    }

    #[test]
    fn run_clock_formats_label() {
        let t = chrono::Utc.with_ymd_and_hms(2023, 10, 19, 10, 0, 3).unwrap();
        let clock = RunClock::at(&t);
        assert_eq!(clock.epoch, 1_697_709_603);
        assert_eq!(clock.label, "2023-10-19_10:00:03");
    }
}
