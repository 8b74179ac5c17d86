//! ADB command runner capability and `devices -l` parsing.
//!
//! The core never spawns processes itself: it builds argument lists and
//! hands them to an [`AdbRunner`]. The default [`ProcessAdbRunner`] shells
//! out to the adb binary; tests script the runner instead.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AdbOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait AdbRunner: Send + Sync {
    async fn run(&self, adb_path: &str, args: &[String], timeout: Duration) -> Result<AdbOutput>;
}

/// Runs the real adb binary.
pub struct ProcessAdbRunner;

#[async_trait]
impl AdbRunner for ProcessAdbRunner {
    async fn run(&self, adb_path: &str, args: &[String], timeout: Duration) -> Result<AdbOutput> {
        debug!("adb {}", args.join(" "));
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(adb_path).args(args).kill_on_drop(true).output(),
        )
        .await
        .with_context(|| format!("adb {} timed out after {timeout:?}", args.join(" ")))?
        .with_context(|| format!("spawning {adb_path}"))?;

        Ok(AdbOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ── devices -l parsing ────────────────────────────────────────────────────────

/// One row of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDevice {
    pub serial: String,
    /// adb state string: `device`, `unauthorized`, `offline`, …
    pub state: String,
    pub model: Option<String>,
    pub device: Option<String>,
}

impl AdbDevice {
    pub fn is_authorized(&self) -> bool {
        self.state == "device"
    }
}

/// Parse `adb devices -l` output.
///
/// Each non-header line is split on whitespace: first token serial, second
/// the state, later `model:`/`device:` tokens carry the product names.
/// Unknown trailing tokens are ignored for forward compatibility.
pub fn parse_devices_output(stdout: &str) -> Vec<AdbDevice> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of devices"))
        .filter(|line| !line.starts_with('*')) // daemon start notices
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?.to_owned();
            let state = tokens.next()?.to_owned();
            let mut model = None;
            let mut device = None;
            for token in tokens {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_owned());
                } else if let Some(value) = token.strip_prefix("device:") {
                    device = Some(value.to_owned());
                }
            }
            Some(AdbDevice { serial, state, model, device })
        })
        .collect()
}
