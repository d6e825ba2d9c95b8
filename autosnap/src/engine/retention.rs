//! Tiered retention: tier policies, snapshot classification and the
//! per-(dataset, tier) create/prune decision.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::batch::PendingBatch;
use super::RunClock;
use crate::storage::Snapshot;

/// Prefix shared by every snapshot this tool creates.
pub const SNAPSHOT_PREFIX: &str = "autosnap";

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// One retention category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Frequently,
    Hourly,
    Daily,
    Monthly,
    Yearly,
    /// Synthetic tier written only at an ownership handoff.
    Stopped,
}

impl Tier {
    /// Evaluation order for a single dataset.
    pub const ALL: [Tier; 6] = [
        Tier::Yearly,
        Tier::Monthly,
        Tier::Daily,
        Tier::Hourly,
        Tier::Frequently,
        Tier::Stopped,
    ];

    /// The tag embedded at the end of the snapshot name.
    pub fn tag(self) -> &'static str {
        match self {
            Tier::Frequently => "frequently",
            Tier::Hourly => "hourly",
            Tier::Daily => "daily",
            Tier::Monthly => "monthly",
            Tier::Yearly => "yearly",
            Tier::Stopped => "stopped",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Tier::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// Map a CLI token letter to its tier and fixed interval.
    ///
    /// The stopped tier has no letter; its count comes from configuration.
    pub fn from_letter(letter: char) -> Option<(Self, i64)> {
        match letter {
            'f' => Some((Tier::Frequently, 0)),
            'h' => Some((Tier::Hourly, HOUR)),
            'd' => Some((Tier::Daily, DAY)),
            'm' => Some((Tier::Monthly, 30 * DAY)),
            'y' => Some((Tier::Yearly, 365 * DAY)),
            _ => None,
        }
    }

    /// Whether the scheduler may create snapshots of this tier on its own.
    ///
    /// Stopped snapshots are only written by the ownership reconciler; the
    /// scheduler prunes them but never adds new ones.
    pub fn scheduled(self) -> bool {
        self != Tier::Stopped
    }

    /// Snapshot name for a new snapshot of this tier.
    pub fn snapshot_name(self, dataset: &str, clock: &RunClock) -> String {
        format!("{}@{}_{}_{}", dataset, SNAPSHOT_PREFIX, clock.label, self.tag())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Count limit and minimum spacing for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierPolicy {
    pub max_count: usize,
    pub interval_secs: i64,
}

/// Errors raised while parsing `<letter><integer>` tier tokens.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TierTokenError {
    #[error("at least one tier token is required (e.g. f4 h24 d7 m12 y3)")]
    NoTokens,

    #[error("empty tier token")]
    Empty,

    #[error("unknown parameter '{0}': expected one of f, h, d, m, y followed by a count")]
    UnknownLetter(String),

    #[error("parameter '{0}' is not a number")]
    InvalidCount(String),
}

/// Policies keyed by tier. A tier missing from the map keeps nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierPolicies {
    policies: BTreeMap<Tier, TierPolicy>,
}

impl TierPolicies {
    /// Parse CLI tokens such as `f4 h24 d7 m12 y3`.
    ///
    /// A letter given twice keeps the last value.
    pub fn parse_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self, TierTokenError> {
        if tokens.is_empty() {
            return Err(TierTokenError::NoTokens);
        }
        let mut policies = Self::default();
        for token in tokens {
            let token = token.as_ref();
            let (tier, policy) = parse_token(token)?;
            policies.insert(tier, policy);
        }
        Ok(policies)
    }

    pub fn insert(&mut self, tier: Tier, policy: TierPolicy) {
        self.policies.insert(tier, policy);
    }

    /// Policy for `tier`, falling back to a zero count (prune everything).
    pub fn get(&self, tier: Tier) -> TierPolicy {
        self.policies.get(&tier).copied().unwrap_or_default()
    }

    pub fn contains(&self, tier: Tier) -> bool {
        self.policies.contains_key(&tier)
    }
}

impl FromStr for TierPolicies {
    type Err = TierTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        Self::parse_tokens(&tokens)
    }
}

fn parse_token(token: &str) -> Result<(Tier, TierPolicy), TierTokenError> {
    let mut chars = token.chars();
    let letter = chars.next().ok_or(TierTokenError::Empty)?;
    let (tier, interval_secs) =
        Tier::from_letter(letter).ok_or_else(|| TierTokenError::UnknownLetter(token.to_string()))?;
    let max_count = chars
        .as_str()
        .parse::<usize>()
        .map_err(|_| TierTokenError::InvalidCount(token.to_string()))?;
    Ok((
        tier,
        TierPolicy {
            max_count,
            interval_secs,
        },
    ))
}

fn autosnap_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"@autosnap_[0-9]{4}-[0-9]{2}-[0-9]{2}_[0-9]{2}:[0-9]{2}:[0-9]{2}_([a-z]+)")
            .expect("static autosnap pattern")
    })
}

/// Tier a snapshot belongs to, if its name follows the autosnap convention.
pub fn classify(name: &str) -> Option<Tier> {
    let caps = autosnap_re().captures(name)?;
    Tier::from_tag(caps.get(1)?.as_str())
}

/// Group snapshots by tier, each group sorted oldest first.
///
/// Names that do not follow the convention, or carry an unknown tag, are
/// dropped: they are neither counted nor pruned.
pub fn group_by_tier(snapshots: &[Snapshot]) -> HashMap<Tier, Vec<Snapshot>> {
    let mut groups: HashMap<Tier, Vec<Snapshot>> = HashMap::new();
    for snap in snapshots {
        if let Some(tier) = classify(&snap.name) {
            groups.entry(tier).or_default().push(snap.clone());
        }
    }
    for group in groups.values_mut() {
        group.sort_by_key(|s| s.creation);
    }
    groups
}

/// Decide creates and destroys for one tier of one dataset.
///
/// `existing` must be this tier's snapshots in ascending creation order.
pub fn schedule(
    batch: &mut PendingBatch,
    dataset: &str,
    tier: Tier,
    existing: &[Snapshot],
    policy: TierPolicy,
    clock: &RunClock,
    grace_secs: i64,
) {
    let mut count = existing.len();
    let last_creation = existing.last().map(|s| s.creation).unwrap_or(0);

    if policy.max_count == 0 {
        batch.destroy_snapshots.extend(existing.iter().map(|s| s.name.clone()));
        return;
    }

    if tier.scheduled()
        && last_creation.saturating_add(policy.interval_secs) < clock.epoch.saturating_add(grace_secs)
    {
        let name = tier.snapshot_name(dataset, clock);
        // Re-running within the same second would collide with a snapshot
        // that already exists, which fails the whole create request.
        if !existing.iter().any(|s| s.name == name) {
            batch.create_snapshots.push(name);
            count += 1;
        }
    }

    if count > policy.max_count {
        let evict = (count - policy.max_count).min(existing.len());
        batch
            .destroy_snapshots
            .extend(existing[..evict].iter().map(|s| s.name.clone()));
    }
}

/// Run the scheduler over every tier of one dataset.
pub fn schedule_dataset(
    batch: &mut PendingBatch,
    dataset: &str,
    snapshots: &[Snapshot],
    policies: &TierPolicies,
    clock: &RunClock,
    grace_secs: i64,
) {
    let groups = group_by_tier(snapshots);
    for tier in Tier::ALL {
        let existing = groups.get(&tier).map(Vec::as_slice).unwrap_or(&[]);
        schedule(batch, dataset, tier, existing, policies.get(tier), clock, grace_secs);
    }
}
