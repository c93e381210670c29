//! Infrastructure provisioner: endpoint outputs and preflight checks.
//!
//! Only read-only operations are exposed. Applying or destroying
//! infrastructure happens outside this tool.

use crate::registry::TargetRegistry;
use async_trait::async_trait;
use readycheck_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// What `plan` found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// The deployed infrastructure differs from its configuration.
    pub changes_pending: bool,
    pub output: String,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Output values of the current deployment, stringified.
    async fn outputs(&self) -> Result<BTreeMap<String, String>>;

    async fn validate(&self) -> Result<()>;

    async fn plan(&self) -> Result<PlanSummary>;
}

/// Provisioner backed by the `terraform` CLI in one working directory.
pub struct TerraformCli {
    binary: PathBuf,
    dir: PathBuf,
}

impl TerraformCli {
    /// Locate the terraform binary on PATH.
    pub fn locate(dir: impl Into<PathBuf>) -> Result<Self> {
        let binary = which::which("terraform")
            .map_err(|e| Error::Provisioner(format!("terraform binary not found: {}", e)))?;
        Self::with_binary(binary, dir)
    }

    pub fn with_binary(binary: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "terraform directory {} does not exist",
                dir.display()
            )));
        }
        Ok(Self {
            binary: binary.into(),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("terraform {}", args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .current_dir(&self.dir)
            .env("TF_IN_AUTOMATION", "1")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Provisioner(format!("failed to run terraform: {}", e)))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(Error::Provisioner(format!(
                "terraform {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Provisioner for TerraformCli {
    async fn outputs(&self) -> Result<BTreeMap<String, String>> {
        let stdout = self.run_checked(&["output", "-json", "-no-color"]).await?;
        parse_outputs(&stdout)
    }

    async fn validate(&self) -> Result<()> {
        self.run_checked(&["init", "-input=false", "-backend=false", "-no-color"])
            .await?;
        self.run_checked(&["validate", "-no-color"]).await?;
        Ok(())
    }

    async fn plan(&self) -> Result<PlanSummary> {
        let output = self
            .run(&["plan", "-input=false", "-no-color", "-detailed-exitcode"])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        match output.status.code() {
            Some(0) => Ok(PlanSummary {
                changes_pending: false,
                output: stdout,
            }),
            Some(2) => Ok(PlanSummary {
                changes_pending: true,
                output: stdout,
            }),
            _ => Err(Error::Provisioner(format!(
                "terraform plan failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

#[derive(Deserialize)]
struct RawOutput {
    value: serde_json::Value,
}

/// Parse `terraform output -json`: `{"name": {"value": ...}, ...}`.
pub(crate) fn parse_outputs(stdout: &str) -> Result<BTreeMap<String, String>> {
    if stdout.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let raw: BTreeMap<String, RawOutput> = serde_json::from_str(stdout)
        .map_err(|e| Error::Provisioner(format!("unreadable terraform outputs: {}", e)))?;
    Ok(raw
        .into_iter()
        .map(|(name, output)| {
            let value = match output.value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (name, value)
        })
        .collect())
}

/// Result of a preflight run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreflightReport {
    pub plan: Option<PlanSummary>,
    pub outputs: BTreeMap<String, String>,
    /// Placeholders the registry references but the deployment doesn't provide.
    pub missing_outputs: Vec<String>,
    /// Outputs that exist but are empty.
    pub empty_outputs: Vec<String>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.missing_outputs.is_empty() && self.empty_outputs.is_empty()
    }
}

/// Validate and plan the infrastructure, then check that every endpoint the
/// registry references is present among the outputs.
pub async fn preflight(
    provisioner: &dyn Provisioner,
    registry: &TargetRegistry,
) -> Result<PreflightReport> {
    provisioner.validate().await?;
    info!("Provisioner configuration is valid");

    let plan = provisioner.plan().await?;
    info!(changes_pending = plan.changes_pending, "Provisioner plan complete");

    let outputs = provisioner.outputs().await?;
    let missing_outputs = registry
        .placeholders()
        .into_iter()
        .filter(|name| !outputs.contains_key(name))
        .collect();
    let empty_outputs = outputs
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name.clone())
        .collect();

    Ok(PreflightReport {
        plan: Some(plan),
        outputs,
        missing_outputs,
        empty_outputs,
    })
}
