//! CLI-only subcommand implementations: `check` and `program`.
//!
//! These commands never mutate storage. `check` is meant to be run once on a
//! fresh node before installing the crontab entry.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::engine::BatchCategory;
use crate::storage::program;

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Oldest OpenZFS release whose channel programs can set user properties.
const MIN_ZFS_VERSION: (u32, u32) = (2, 2);

/// Run `pve-autosnap check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_zfs(config),
        check_pools(config),
        check_pvesh(config),
        check_crontab(),
        check_node(config),
    ];

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    if all_pass {
        let hint = match std::env::current_exe() {
            Ok(exe) => format!("{} install-cron f4 h24 d7 m3", exe.display()),
            Err(_) => "pve-autosnap install-cron f4 h24 d7 m3".to_string(),
        };
        println!("All checks passed. Schedule with e.g.: {}", hint);
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

/// Extract (major, minor) from `zfs version` output such as `zfs-2.2.3-pve1`.
fn parse_zfs_version(output: &str) -> Option<(u32, u32)> {
    let first = output.lines().next()?.trim();
    let version = first.strip_prefix("zfs-")?;
    let mut parts = version.split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn check_zfs(config: &Config) -> Check {
    let fix = "Install OpenZFS >= 2.2: apt install zfsutils-linux";
    match std::process::Command::new(&config.storage.zfs_binary)
        .arg("version")
        .output()
    {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let line = stdout.lines().next().unwrap_or("unknown").trim().to_string();
            match parse_zfs_version(&stdout) {
                Some(v) if v >= MIN_ZFS_VERSION => Check::pass("ZFS", line),
                Some(_) => Check::fail(
                    "ZFS",
                    format!("{} cannot set properties from channel programs", line),
                    fix,
                ),
                None => Check::fail("ZFS", format!("unrecognised version: {}", line), fix),
            }
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail("ZFS", format!("zfs exited with error: {}", stderr.trim()), fix)
        }
        Err(e) => Check::fail("ZFS", format!("zfs not found: {}", e), fix),
    }
}

fn check_pools(config: &Config) -> Check {
    let fix = "Import the pool or fix storage.pools in the config";
    let out = match std::process::Command::new(&config.storage.zpool_binary)
        .args(["list", "-H", "-o", "name"])
        .output()
    {
        Ok(out) => out,
        Err(e) => return Check::fail("ZFS pools", format!("zpool list failed: {}", e), fix),
    };
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Check::fail("ZFS pools", format!("zpool list failed: {}", stderr.trim()), fix);
    }

    let imported = crate::storage::zfs::parse_pool_list(&String::from_utf8_lossy(&out.stdout));
    let missing: Vec<&str> = config
        .storage
        .pools
        .iter()
        .filter(|p| !imported.contains(p))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        Check::fail("ZFS pools", format!("not imported: {}", missing.join(", ")), fix)
    } else if imported.is_empty() {
        Check::fail("ZFS pools", "no pools imported", fix)
    } else {
        Check::pass("ZFS pools", imported.join(", "))
    }
}

fn check_pvesh(config: &Config) -> Check {
    let binary = &config.cluster.pvesh_binary;
    let fix = "Run on a Proxmox VE node, or set cluster.pvesh_binary";
    match std::process::Command::new(binary)
        .args(["get", "/version", "--output-format", "json"])
        .output()
    {
        Ok(out) if out.status.success() => {
            let version = serde_json::from_slice::<serde_json::Value>(&out.stdout)
                .ok()
                .and_then(|v| v.get("version").and_then(|s| s.as_str()).map(String::from))
                .unwrap_or_else(|| "unknown version".to_string());
            Check::pass("pvesh", format!("Proxmox VE {}", version))
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail("pvesh", format!("pvesh exited with error: {}", stderr.trim()), fix)
        }
        Err(e) => Check::fail("pvesh", format!("{} not found: {}", binary.display(), e), fix),
    }
}

fn check_crontab() -> Check {
    // `crontab -l` exits non-zero when the user has no crontab yet.
    match std::process::Command::new("crontab").arg("-l").output() {
        Ok(_) => Check::pass("crontab", "available"),
        Err(e) => Check::fail(
            "crontab",
            format!("crontab not found: {}", e),
            "Install cron: apt install cron",
        ),
    }
}

fn check_node(config: &Config) -> Check {
    match config.node.resolve() {
        Ok(name) => Check::pass("Node name", name),
        Err(e) => Check::fail("Node name", format!("{:#}", e), "Set [node] name in the config"),
    }
}

// ---------------------------------------------------------------------------
// program
// ---------------------------------------------------------------------------

/// Print the channel program used for `category`.
pub fn print_program(category: BatchCategory) {
    print!("{}", program::source(category));
}

/// Load a config from an optional path. Without one, the default path is used
/// if it exists, otherwise built-in defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load(Path::new(DEFAULT_CONFIG_PATH))
        }
        None => Ok(Config::default()),
    }
}
