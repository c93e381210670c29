//! Container runtime client.
//!
//! The engine only reads runtime state: it inspects containers, tails their
//! logs and runs read-only commands inside them. Starting, stopping and
//! building containers is somebody else's job.

use async_trait::async_trait;
use readycheck_common::{Error, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Lifecycle state reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Created,
    Restarting,
    Paused,
    Exited,
    Dead,
    Removing,
    Other(String),
}

impl ContainerState {
    pub fn parse(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "running" => ContainerState::Running,
            "created" => ContainerState::Created,
            "restarting" => ContainerState::Restarting,
            "paused" => ContainerState::Paused,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            "removing" => ContainerState::Removing,
            other => ContainerState::Other(other.to_string()),
        }
    }

    /// States a container does not leave on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerState::Exited | ContainerState::Dead | ContainerState::Paused
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Running => write!(f, "running"),
            ContainerState::Created => write!(f, "created"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Status of the runtime's own health check, when the image declares one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
    None,
}

impl HealthStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            "starting" => HealthStatus::Starting,
            _ => HealthStatus::None,
        }
    }
}

/// Runtime health descriptor with the tail of its check log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthDescriptor {
    pub status: HealthStatus,
    pub log: Vec<String>,
}

/// A mount attached to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub kind: String,
    pub source: String,
    pub destination: String,
}

/// Snapshot returned by [`ContainerRuntime::inspect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub name: String,
    pub running: bool,
    pub state: ContainerState,
    pub health: Option<HealthDescriptor>,
    pub started_at: Option<Timestamp>,
    pub mounts: Vec<MountInfo>,
    pub env: Vec<String>,
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Read-only view of a container runtime, shared by all target tasks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect a container by name.
    async fn inspect(&self, name: &str) -> Result<ContainerInspect>;

    /// Return the last `tail` lines of the container's stdout and stderr.
    async fn logs(&self, name: &str, tail: u32) -> Result<String>;

    /// Run a command inside a running container.
    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput>;
}

/// Runtime client that drives the `docker` CLI.
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    /// Locate the docker binary on PATH.
    pub fn locate() -> Result<Self> {
        let binary = which::which("docker")
            .map_err(|e| Error::Runtime(format!("docker binary not found: {}", e)))?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("docker {}", args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("failed to run docker: {}", e)))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name: &str) -> Result<ContainerInspect> {
        let output = self.run(&["inspect", "--type", "container", name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such") {
                return Err(Error::ContainerNotFound(name.to_string()));
            }
            return Err(Error::Runtime(format!(
                "docker inspect {} failed: {}",
                name,
                stderr.trim()
            )));
        }
        parse_inspect(name, &output.stdout)
    }

    async fn logs(&self, name: &str, tail: u32) -> Result<String> {
        let tail = tail.to_string();
        let output = self.run(&["logs", "--tail", &tail, name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Runtime(format!(
                "docker logs {} failed: {}",
                name,
                stderr.trim()
            )));
        }

        // Containers write to both streams; the scan treats them as one tail.
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let mut args = vec!["exec", name];
        args.extend(command.iter().map(String::as_str));
        let output = self.run(&args).await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            exit_code: output.status.code(),
            output: combined,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInspect {
    name: Option<String>,
    state: RawState,
    #[serde(default)]
    mounts: Vec<RawMount>,
    config: Option<RawConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    status: String,
    running: bool,
    started_at: Option<String>,
    health: Option<RawHealth>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHealth {
    status: String,
    #[serde(default)]
    log: Vec<RawHealthLog>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHealthLog {
    exit_code: Option<i64>,
    #[serde(default)]
    output: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMount {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    env: Option<Vec<String>>,
}

/// Parse the JSON array printed by `docker inspect`.
pub(crate) fn parse_inspect(name: &str, stdout: &[u8]) -> Result<ContainerInspect> {
    let mut entries: Vec<RawInspect> = serde_json::from_slice(stdout)?;
    if entries.is_empty() {
        return Err(Error::ContainerNotFound(name.to_string()));
    }
    let raw = entries.swap_remove(0);

    let health = raw.state.health.map(|h| HealthDescriptor {
        status: HealthStatus::parse(&h.status),
        log: h
            .log
            .into_iter()
            .map(|entry| match entry.exit_code {
                Some(code) => format!("exit {}: {}", code, entry.output.trim()),
                None => entry.output.trim().to_string(),
            })
            .collect(),
    });

    Ok(ContainerInspect {
        name: raw
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name.to_string()),
        running: raw.state.running,
        state: ContainerState::parse(&raw.state.status),
        health,
        started_at: raw
            .state
            .started_at
            .as_deref()
            .and_then(Timestamp::parse_runtime),
        mounts: raw
            .mounts
            .into_iter()
            .map(|m| MountInfo {
                kind: m.kind,
                source: m.source,
                destination: m.destination,
            })
            .collect(),
        env: raw.config.and_then(|c| c.env).unwrap_or_default(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT_JSON: &str = r#"[
        {
            "Name": "/empire-c2",
            "State": {
                "Status": "running",
                "Running": true,
                "StartedAt": "2024-03-01T10:15:30.123456789Z",
                "Health": {
                    "Status": "unhealthy",
                    "Log": [
                        {"ExitCode": 1, "Output": "curl: (7) Failed to connect\n"}
                    ]
                }
            },
            "Mounts": [
                {"Type": "bind", "Source": "/srv/empire", "Destination": "/empire"}
            ],
            "Config": {"Env": ["PATH=/usr/bin", "STAGING_KEY=x"]}
        }
    ]"#;

    #[test]
    fn test_parse_inspect() {
        let inspect = parse_inspect("empire-c2", INSPECT_JSON.as_bytes()).unwrap();
        assert_eq!(inspect.name, "empire-c2");
        assert!(inspect.running);
        assert_eq!(inspect.state, ContainerState::Running);
        let health = inspect.health.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.log, vec!["exit 1: curl: (7) Failed to connect"]);
        assert!(inspect.started_at.is_some());
        assert_eq!(inspect.mounts[0].destination, "/empire");
        assert_eq!(inspect.env.len(), 2);
    }

    #[test]
    fn test_parse_inspect_without_health() {
        let json = r#"[{"State": {"Status": "exited", "Running": false,
            "StartedAt": "0001-01-01T00:00:00Z"}}]"#;
        let inspect = parse_inspect("sliver-c2", json.as_bytes()).unwrap();
        assert_eq!(inspect.name, "sliver-c2");
        assert!(inspect.health.is_none());
        assert!(inspect.started_at.is_none());
        assert!(inspect.state.is_terminal());
    }

    #[test]
    fn test_parse_inspect_empty_array() {
        let err = parse_inspect("ghost", b"[]").unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound(_)));
    }

    #[test]
    fn test_container_state_terminality() {
        assert!(!ContainerState::parse("Running").is_terminal());
        assert!(!ContainerState::parse("restarting").is_terminal());
        assert!(!ContainerState::parse("created").is_terminal());
        assert!(ContainerState::parse("exited").is_terminal());
        assert!(ContainerState::parse("dead").is_terminal());
        assert_eq!(
            ContainerState::parse("weird"),
            ContainerState::Other("weird".into())
        );
    }
}
