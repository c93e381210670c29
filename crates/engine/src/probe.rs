//! Probes: single atomic checks against one target.
//!
//! A probe never fails past its own boundary. Transport, runtime,
//! authentication and timeout errors all come back as a failed
//! [`ProbeResult`] carrying a diagnostic message.

use crate::runtime::{ContainerRuntime, ContainerState, HealthStatus};
use crate::target::{Credentials, LogVocabulary, ProbeDecl, ProbeKind, ProbeSpec, StatusSet, Target};
use readycheck_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Outcome of a single probe invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// The probe ran but had nothing to say (e.g. an empty log tail).
    NotApplicable,
}

/// What a container-state probe saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerObservation {
    pub container: String,
    pub state: ContainerState,
    pub health: Option<HealthStatus>,
}

/// Result of one probe invocation. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub label: String,
    pub kind: ProbeKind,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub matched: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerObservation>,
    pub elapsed_ms: u64,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == Outcome::Failure
    }
}

/// Shared, read-only handles injected into every target task.
#[derive(Clone)]
pub struct ProbeContext {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
}

impl ProbeContext {
    /// Build a context with an HTTP client suited to lab deployments.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true) // self-signed lab certificates
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { runtime, http })
    }
}

struct Observation {
    outcome: Outcome,
    detail: Option<String>,
    status_code: Option<u16>,
    matched: Vec<String>,
    container: Option<ContainerObservation>,
}

impl Observation {
    fn new(outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: Some(detail.into()),
            status_code: None,
            matched: Vec::new(),
            container: None,
        }
    }

    fn success(detail: impl Into<String>) -> Self {
        Self::new(Outcome::Success, detail)
    }

    fn failure(detail: impl Into<String>) -> Self {
        Self::new(Outcome::Failure, detail)
    }

    fn not_applicable(detail: impl Into<String>) -> Self {
        Self::new(Outcome::NotApplicable, detail)
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    fn with_matched(mut self, matched: Vec<String>) -> Self {
        self.matched = matched;
        self
    }

    fn with_container(mut self, container: ContainerObservation) -> Self {
        self.container = Some(container);
        self
    }
}

/// Run one probe against `target`, bounded by the probe's timeout.
pub async fn run_probe(ctx: &ProbeContext, target: &Target, decl: &ProbeDecl) -> ProbeResult {
    let label = decl.label(target);
    let limit = decl.timeout();
    let started = Instant::now();

    let observation = match tokio::time::timeout(limit, observe(ctx, target, decl)).await {
        Ok(Ok(observation)) => observation,
        Ok(Err(e)) => Observation::failure(e.to_string()),
        Err(_) => Observation::failure(Error::timeout(label.clone(), limit).to_string()),
    };

    let result = ProbeResult {
        label,
        kind: decl.kind(),
        outcome: observation.outcome,
        detail: observation.detail,
        status_code: observation.status_code,
        matched: observation.matched,
        container: observation.container,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    debug!(
        target_name = %target.name,
        probe = %result.label,
        outcome = ?result.outcome,
        "{}",
        result.detail.as_deref().unwrap_or("")
    );
    result
}

async fn observe(ctx: &ProbeContext, target: &Target, decl: &ProbeDecl) -> Result<Observation> {
    match &decl.spec {
        ProbeSpec::ContainerState {
            container,
            min_uptime_secs,
        } => {
            let name = target.container_for(container);
            container_state(ctx, name, min_uptime_secs.map(Duration::from_secs)).await
        }
        ProbeSpec::TcpReachability { host, port } => {
            tcp_reachability(host.as_deref().unwrap_or(&target.host), *port).await
        }
        ProbeSpec::HttpStatus {
            url,
            fallback_urls,
            expect,
        } => http_status(ctx, url, fallback_urls, expect).await,
        ProbeSpec::AuthenticatedApi {
            login_url,
            credentials,
            token_field,
            follow_up_url,
            expect,
        } => {
            authenticated_api(ctx, login_url, credentials, token_field, follow_up_url, expect)
                .await
        }
        ProbeSpec::LogScan {
            container,
            tail,
            indicators,
        } => {
            let name = target.container_for(container);
            log_scan(ctx, name, *tail, target.vocabulary_for(indicators)).await
        }
        ProbeSpec::Exec {
            container,
            command,
            expect,
        } => {
            let name = target.container_for(container);
            exec_expect(ctx, name, command, expect).await
        }
    }
}

async fn container_state(
    ctx: &ProbeContext,
    name: &str,
    min_uptime: Option<Duration>,
) -> Result<Observation> {
    let inspect = ctx.runtime.inspect(name).await?;
    let health = inspect.health.as_ref().map(|h| h.status);
    let seen = ContainerObservation {
        container: inspect.name.clone(),
        state: inspect.state.clone(),
        health,
    };

    if !inspect.running {
        return Ok(Observation::failure(format!("container state is {}", inspect.state))
            .with_container(seen));
    }

    if let (Some(min), Some(started_at)) = (min_uptime, inspect.started_at) {
        let age = started_at.age();
        if age < min {
            return Ok(Observation::failure(format!(
                "running for {}s, below minimum uptime {}s",
                age.as_secs(),
                min.as_secs()
            ))
            .with_container(seen));
        }
    }

    let detail = match &inspect.health {
        Some(h) if h.status == HealthStatus::Unhealthy => match h.log.last() {
            Some(last) => format!("running, runtime health unhealthy ({})", last),
            None => "running, runtime health unhealthy".to_string(),
        },
        Some(h) => format!("running, runtime health {:?}", h.status).to_lowercase(),
        None => "running, no runtime health check".to_string(),
    };
    Ok(Observation::success(detail).with_container(seen))
}

async fn tcp_reachability(host: &str, port: u16) -> Result<Observation> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Transport(format!("dial {}:{}: {}", host, port, e)))?;
    drop(stream);
    Ok(Observation::success(format!("{}:{} accepts connections", host, port)))
}

async fn http_status(
    ctx: &ProbeContext,
    url: &str,
    fallback_urls: &[String],
    expect: &StatusSet,
) -> Result<Observation> {
    let mut errors = Vec::new();
    for candidate in std::iter::once(url).chain(fallback_urls.iter().map(String::as_str)) {
        match ctx.http.get(candidate).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let observation = if expect.contains(status) {
                    Observation::success(format!("{} returned {}", candidate, status))
                } else {
                    Observation::failure(format!(
                        "{} returned {}, expected {}",
                        candidate, status, expect
                    ))
                };
                return Ok(observation.with_status(status));
            }
            Err(e) => errors.push(format!("{}: {}", candidate, e)),
        }
    }
    Err(Error::Transport(errors.join("; ")))
}

async fn authenticated_api(
    ctx: &ProbeContext,
    login_url: &str,
    credentials: &Credentials,
    token_field: &str,
    follow_up_url: &str,
    expect: &StatusSet,
) -> Result<Observation> {
    let request = ctx.http.post(login_url);
    let request = match credentials {
        Credentials::Form { fields } => request.form(fields),
        Credentials::Json { body } => request.json(body),
    };
    let response = request
        .send()
        .await
        .map_err(|e| Error::Transport(format!("login {}: {}", login_url, e)))?;

    let status = response.status().as_u16();
    if status != 200 {
        let err = Error::Authentication(format!("{} returned {}", login_url, status));
        return Ok(Observation::failure(err.to_string()).with_status(status));
    }

    let body: serde_json::Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            let err = Error::Authentication(format!("login response is not JSON: {}", e));
            return Ok(Observation::failure(err.to_string()).with_status(status));
        }
    };
    let Some(token) = extract_token(&body, token_field) else {
        let err = Error::Authentication(format!("login response has no '{}'", token_field));
        return Ok(Observation::failure(err.to_string()).with_status(status));
    };

    let response = ctx
        .http
        .get(follow_up_url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| Error::Transport(format!("follow-up {}: {}", follow_up_url, e)))?;
    let status = response.status().as_u16();
    let observation = if expect.contains(status) {
        Observation::success(format!("authenticated; {} returned {}", follow_up_url, status))
    } else {
        Observation::failure(format!(
            "authenticated; {} returned {}, expected {}",
            follow_up_url, status, expect
        ))
    };
    Ok(observation.with_status(status))
}

/// Token lookup by top-level key, or by JSON pointer when `field` starts with `/`.
fn extract_token<'a>(body: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    let value = if field.starts_with('/') {
        body.pointer(field)
    } else {
        body.get(field)
    };
    value.and_then(|v| v.as_str()).filter(|t| !t.is_empty())
}

async fn log_scan(
    ctx: &ProbeContext,
    name: &str,
    tail: u32,
    vocabulary: &LogVocabulary,
) -> Result<Observation> {
    let logs = ctx.runtime.logs(name, tail).await?;
    if logs.trim().is_empty() {
        return Ok(Observation::not_applicable(format!("{} has no log output yet", name)));
    }

    let scan = vocabulary.scan(&logs);
    if !scan.bad.is_empty() {
        return Ok(Observation::failure(format!(
            "{} logs contain {} bad indicator(s)",
            name,
            scan.bad.len()
        ))
        .with_matched(scan.bad));
    }
    if scan.good.is_empty() {
        return Ok(Observation::failure(format!(
            "no good indicator in last {} lines of {}",
            tail, name
        )));
    }
    Ok(Observation::success(format!("{} logs look healthy", name)).with_matched(scan.good))
}

async fn exec_expect(
    ctx: &ProbeContext,
    name: &str,
    command: &[String],
    expect: &str,
) -> Result<Observation> {
    let output = ctx.runtime.exec(name, command).await?;
    if output.output.to_lowercase().contains(&expect.to_lowercase()) {
        return Ok(Observation::success(format!("output contains '{}'", expect))
            .with_matched(vec![expect.to_string()]));
    }
    let exit = output
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    Ok(Observation::failure(format!(
        "output lacks '{}' (exit code {})",
        expect, exit
    )))
}
