//! Associates datasets with Proxmox workloads by disk naming convention.

use std::sync::OnceLock;

use regex::Regex;

use crate::storage::Dataset;

/// Build `vm-(ids)-disk-|subvol-(ids)-disk-` for the given ids.
///
/// Returns `None` for an empty id set: an empty alternation would match
/// every name.
pub fn workload_pattern(ids: &[u32]) -> Option<Regex> {
    if ids.is_empty() {
        return None;
    }
    let alternation = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!("vm-({alt})-disk-|subvol-({alt})-disk-", alt = alternation);
    // Digits and '|' only, so this cannot fail.
    Regex::new(&pattern).ok()
}

/// Keep the datasets whose names belong to one of `ids`.
pub fn match_datasets(datasets: &[Dataset], ids: &[u32]) -> Vec<Dataset> {
    let Some(re) = workload_pattern(ids) else {
        return Vec::new();
    };
    datasets
        .iter()
        .filter(|ds| re.is_match(&ds.name))
        .cloned()
        .collect()
}

/// The workload id a dataset name refers to, if any.
pub fn workload_id(dataset: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?:vm|subvol)-([0-9]+)-disk-").expect("static disk pattern")
    });
    re.captures(dataset)?.get(1)?.as_str().parse().ok()
}
