//! Package materialisation.
//!
//! The engine never unpacks tarballs itself; a registry-aware install
//! command (yarn by default) is invoked as a black box to populate
//! `node_modules/<name>/...` inside a caller-owned working directory.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::error::{EsmdError, Result};

/// Wrapper around the external install command.
#[derive(Debug, Clone)]
pub struct PackageInstaller {
    command: String,
    registry_url: String,
}

impl PackageInstaller {
    /// Create a new installer around `command` (e.g. `yarn`).
    pub fn new(command: impl Into<String>, registry_url: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            registry_url: registry_url.into(),
        }
    }

    /// Materialise `specs` (each `name@version`) into `wd/node_modules`.
    /// Stdout and stderr are captured and reported on failure.
    pub async fn add(&self, wd: &Path, specs: &[String]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }

        debug!("installing {} in {}", specs.join(" "), wd.display());

        let output = Command::new(&self.command)
            .arg("add")
            .args(specs)
            .arg("--registry")
            .arg(&self.registry_url)
            .current_dir(wd)
            .output()
            .await
            .map_err(|e| EsmdError::Install(format!("spawn {}: {}", self.command, e)))?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(EsmdError::Install(format!(
                "{} add {}: {}",
                self.command,
                specs.join(" "),
                combined.trim()
            )));
        }

        Ok(())
    }
}
