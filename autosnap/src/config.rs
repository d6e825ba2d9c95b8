use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::OwnerMarker;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pve-autosnap.toml";

/// Top-level configuration for pve-autosnap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub cluster: ClusterConfig,
    pub retention: RetentionConfig,
    pub schedule: ScheduleConfig,
    pub run: RunConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.node.name {
            check_node_name(name.trim()).context("node.name")?;
        }
        for (key, prop) in [
            ("storage.owner_property", &self.storage.owner_property),
            ("storage.nosnap_property", &self.storage.nosnap_property),
        ] {
            anyhow::ensure!(
                prop.contains(':'),
                "{} must be a ZFS user property (module:name): {}",
                key,
                prop
            );
        }
        anyhow::ensure!(
            self.storage.owner_property != self.storage.nosnap_property,
            "storage.owner_property and storage.nosnap_property must differ"
        );
        anyhow::ensure!(
            !self.storage.nosnap_value.is_empty(),
            "storage.nosnap_value must not be empty"
        );
        for (i, pool) in self.storage.pools.iter().enumerate() {
            anyhow::ensure!(
                !pool.is_empty() && !pool.contains('/'),
                "storage.pools[{}] is not a pool name: {:?}",
                i,
                pool
            );
        }
        anyhow::ensure!(
            self.retention.grace_secs >= 0,
            "retention.grace_secs must be >= 0"
        );
        anyhow::ensure!(
            self.schedule.cron.split_whitespace().count() == 5,
            "schedule.cron must have five fields: {:?}",
            self.schedule.cron
        );
        Ok(())
    }
}

/// Identity of the local cluster node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id written into owner markers. Defaults to the hostname, which is
    /// what Proxmox uses as the node name.
    pub name: Option<String>,
}

impl NodeConfig {
    /// The configured name, or the hostname. Either must be usable as an
    /// owner marker value.
    pub fn resolve(&self) -> Result<String> {
        let name = match &self.name {
            Some(name) => name.trim().to_string(),
            None => crate::util::hostname().context("resolving node name from hostname")?,
        };
        check_node_name(&name)?;
        Ok(name)
    }
}

/// A node id must not read back as one of the reserved marker values.
fn check_node_name(name: &str) -> Result<()> {
    anyhow::ensure!(!name.is_empty(), "node name must not be empty");
    anyhow::ensure!(
        OwnerMarker::from_property(name).is_node(name),
        "node name must not be a reserved marker value: {}",
        name
    );
    Ok(())
}

/// ZFS storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// User property holding the owner marker.
    pub owner_property: String,
    /// User property that opts a dataset out of scheduled snapshots.
    pub nosnap_property: String,
    /// Value of `nosnap_property` meaning "excluded".
    pub nosnap_value: String,
    /// Pools to process. Empty means every imported pool.
    pub pools: Vec<String>,
    pub zfs_binary: PathBuf,
    pub zpool_binary: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            owner_property: "label:running".into(),
            nosnap_property: "label:nosnap".into(),
            nosnap_value: "nosnap".into(),
            pools: Vec::new(),
            zfs_binary: PathBuf::from("zfs"),
            zpool_binary: PathBuf::from("zpool"),
        }
    }
}

/// Proxmox cluster API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub pvesh_binary: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            pvesh_binary: PathBuf::from("pvesh"),
        }
    }
}

/// Retention knobs not expressed by tier tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Seconds of slack added to "now" when deciding whether a tier is due.
    pub grace_secs: i64,
    /// Closing snapshots kept per dataset. Unset prunes them all.
    pub stopped_count: Option<usize>,
}

/// Crontab entry written by `install-cron`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "*/15 * * * *".into(),
        }
    }
}

/// Settings for a single `run` pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Held with an exclusive flock for the duration of a run.
    pub lock_file: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from("/run/pve-autosnap.lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut tmpfile = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        tmpfile.write_all(content.as_bytes()).unwrap();
        tmpfile
    }

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert!(config.node.name.is_none());
        assert_eq!(config.storage.owner_property, "label:running");
        assert_eq!(config.storage.nosnap_property, "label:nosnap");
        assert_eq!(config.storage.nosnap_value, "nosnap");
        assert!(config.storage.pools.is_empty());
        assert_eq!(config.cluster.pvesh_binary, PathBuf::from("pvesh"));
        assert_eq!(config.retention.grace_secs, 0);
        assert!(config.retention.stopped_count.is_none());
        assert_eq!(config.schedule.cron, "*/15 * * * *");
        assert_eq!(config.run.lock_file, PathBuf::from("/run/pve-autosnap.lock"));
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let tmpfile = write_config(
            r#"
[node]
name = "pve2"

[storage]
owner_property = "com.example:owner"
pools = ["rpool", "tank"]

[retention]
grace_secs = 60
stopped_count = 3
"#,
        );

        let config = Config::load(tmpfile.path()).unwrap();
        assert_eq!(config.node.name.as_deref(), Some("pve2"));
        assert_eq!(config.storage.owner_property, "com.example:owner");
        assert_eq!(config.storage.pools, vec!["rpool", "tank"]);
        // Unset fields use defaults
        assert_eq!(config.storage.nosnap_property, "label:nosnap");
        assert_eq!(config.retention.grace_secs, 60);
        assert_eq!(config.retention.stopped_count, Some(3));
        assert_eq!(config.schedule.cron, "*/15 * * * *");
    }

    #[test]
    fn config_load_rejects_unparsable_toml() {
        let tmpfile = write_config("[storage\n");
        let err = Config::load(tmpfile.path()).unwrap_err();
        assert!(err.to_string().contains("parsing config"));
    }

    #[test]
    fn config_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/pve-autosnap.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }

    #[test]
    fn config_validation_rejects_reserved_node_names() {
        let mut config = Config::default();
        for name in ["stopped", "-", "  "] {
            config.node.name = Some(name.into());
            assert!(config.validate().is_err(), "{name:?} accepted");
        }
    }

    #[test]
    fn config_validation_rejects_native_property() {
        let mut config = Config::default();
        config.storage.owner_property = "comment".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_shared_property() {
        let mut config = Config::default();
        config.storage.nosnap_property = config.storage.owner_property.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_dataset_as_pool() {
        let mut config = Config::default();
        config.storage.pools = vec!["rpool/data".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_negative_grace() {
        let mut config = Config::default();
        config.retention.grace_secs = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_short_cron() {
        let mut config = Config::default();
        config.schedule.cron = "*/15 * *".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_rejects_reserved_names() {
        for name in ["stopped", "-", ""] {
            let node = NodeConfig {
                name: Some(name.into()),
            };
            assert!(node.resolve().is_err(), "{name:?} accepted");
        }
    }

    #[test]
    fn resolve_checks_hostname_too() {
        let name = NodeConfig::default().resolve().unwrap();
        assert!(OwnerMarker::from_property(&name).is_node(&name));
    }

    #[test]
    fn run_section_sets_lock_file() {
        let tmpfile = write_config("[run]\nlock_file = \"/tmp/autosnap-test.lock\"\n");
        let config = Config::load(tmpfile.path()).unwrap();
        assert_eq!(config.run.lock_file, PathBuf::from("/tmp/autosnap-test.lock"));
    }

    #[test]
    fn node_name_override() {
        let node = NodeConfig {
            name: Some(" pve3 ".into()),
        };
        assert_eq!(node.resolve().unwrap(), "pve3");
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.storage.owner_property, config.storage.owner_property);
        assert_eq!(deserialized.schedule.cron, config.schedule.cron);
        assert_eq!(deserialized.run.lock_file, config.run.lock_file);
    }
}
