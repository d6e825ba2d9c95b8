//! Installs the periodic `run` entry into root's crontab.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

use crate::util::shell_word;

/// Directories holding `zfs`, `zpool`, `pvesh` and `crontab` on Proxmox VE.
pub const SYSTEM_PATH: [&str; 6] = [
    "/usr/local/sbin",
    "/usr/local/bin",
    "/sbin",
    "/bin",
    "/usr/sbin",
    "/usr/bin",
];

/// `current` with every [`SYSTEM_PATH`] entry it lacks appended.
///
/// cron starts jobs with `PATH=/usr/bin:/bin`, which misses the sbin
/// directories the ZFS tools live in.
pub fn augmented_path(current: Option<&OsStr>) -> Result<OsString> {
    let mut dirs: Vec<PathBuf> = current.map(|p| std::env::split_paths(p).collect()).unwrap_or_default();
    for dir in SYSTEM_PATH {
        if !dirs.iter().any(|d| d == Path::new(dir)) {
            dirs.push(PathBuf::from(dir));
        }
    }
    std::env::join_paths(dirs).context("building PATH")
}

/// Build the crontab line running `executable run <tokens...>`.
pub fn cron_line(schedule: &str, executable: &Path, tokens: &[String], config: Option<&Path>) -> String {
    let mut words = vec![
        shell_word(&executable.to_string_lossy()),
        "run".to_string(),
    ];
    words.extend(tokens.iter().map(|t| shell_word(t)));
    if let Some(path) = config {
        words.push("--config".to_string());
        words.push(shell_word(&path.to_string_lossy()));
    }
    // cron turns a bare '%' into a newline.
    format!("{} {}", schedule.trim(), words.join(" ").replace('%', "\\%"))
}

/// Merge `line` into an existing crontab.
///
/// The first uncommented line mentioning `executable` is replaced and any
/// later ones are dropped; if there is none, `line` is appended. Other lines
/// are kept in order. Blank lines are removed.
pub fn merge_crontab(existing: &str, executable: &str, line: &str) -> String {
    let mut merged: Vec<&str> = Vec::new();
    let mut found = false;

    for current in existing.lines() {
        let trimmed = current.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('#') && current.contains(executable) {
            if !found {
                merged.push(line);
                found = true;
            }
            continue;
        }
        merged.push(current);
    }
    if !found {
        merged.push(line);
    }

    let mut out = merged.join("\n");
    out.push('\n');
    out
}

/// `crontab` CLI wrapper.
#[derive(Debug, Clone)]
pub struct Crontab {
    binary: PathBuf,
}

impl Default for Crontab {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("crontab"),
        }
    }
}

impl Crontab {
    /// Current crontab contents. A missing crontab reads as empty.
    pub async fn read(&self) -> Result<String> {
        debug!("running crontab -l");
        let output = Command::new(&self.binary)
            .arg("-l")
            .output()
            .await
            .with_context(|| format!("failed to execute {} -l", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no crontab") {
                return Ok(String::new());
            }
            bail!("crontab -l failed: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Replace the crontab with `content`, piped via stdin.
    pub async fn write(&self, content: &str) -> Result<()> {
        debug!(input_len = content.len(), "running crontab with stdin input");

        let mut child = Command::new(&self.binary)
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;

        use tokio::io::AsyncWriteExt;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            // Drop stdin to close it, signaling EOF
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for crontab")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("crontab - failed: {}", stderr.trim());
        }
        Ok(())
    }

    /// Install or replace the entry for `executable`.
    pub async fn install(&self, executable: &Path, line: &str) -> Result<()> {
        let existing = self.read().await?;
        let merged = merge_crontab(&existing, &executable.to_string_lossy(), line);
        if merged == existing {
            info!("crontab already up to date");
            return Ok(());
        }
        self.write(&merged).await?;
        info!(line = %line, "crontab updated");
        Ok(())
    }
}
