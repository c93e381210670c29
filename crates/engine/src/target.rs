//! Target declarations: what to probe, and how long to keep trying.

use readycheck_common::{Error, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_deadline() -> f64 {
    60.0
}

fn default_delay() -> f64 {
    3.0
}

fn default_tail() -> u32 {
    50
}

fn default_token_field() -> String {
    "access_token".to_string()
}

/// One deployed service under verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub expected_ports: Vec<u16>,
    /// Probes in execution order.
    pub probes: Vec<ProbeDecl>,
    #[serde(default)]
    pub log_indicators: LogVocabulary,
    #[serde(default)]
    pub runtime_health: HealthPolicy,
    /// Multi-minute deployment checks, skipped in short mode.
    #[serde(default)]
    pub slow: bool,
    #[serde(default)]
    pub poll: PollSettings,
}

impl Target {
    /// Vocabulary a log-scan probe checks against.
    pub fn vocabulary_for<'a>(&'a self, indicators: &'a Option<LogVocabulary>) -> &'a LogVocabulary {
        indicators.as_ref().unwrap_or(&self.log_indicators)
    }

    /// Container a probe refers to, defaulting to the target name.
    pub fn container_for<'a>(&'a self, container: &'a Option<String>) -> &'a str {
        container.as_deref().unwrap_or(&self.name)
    }
}

/// Longest deadline, delay or probe timeout a registry may declare.
pub const MAX_SECS: f64 = 86_400.0;

/// Whether `secs` is a usable duration: positive and at most [`MAX_SECS`].
pub fn valid_secs(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0 && secs <= MAX_SECS
}

/// Deadline and inter-attempt delay for one target's poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_deadline")]
    pub deadline_secs: f64,
    #[serde(default = "default_delay")]
    pub delay_secs: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline(),
            delay_secs: default_delay(),
        }
    }
}

impl PollSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs_f64(self.deadline_secs)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_secs)
    }
}

/// How an explicit `unhealthy` runtime health descriptor is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthPolicy {
    /// A passing functional re-check overrides the descriptor.
    #[default]
    Override,
    /// The descriptor is authoritative.
    Strict,
}

/// A probe declaration: the capability plus its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeDecl {
    /// Display label; defaults to a description of the probe.
    #[serde(default)]
    pub label: Option<String>,
    /// Per-call timeout; each kind has its own default.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(flatten)]
    pub spec: ProbeSpec,
}

impl ProbeDecl {
    pub fn new(spec: ProbeSpec) -> Self {
        Self {
            label: None,
            timeout_secs: None,
            spec,
        }
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }

    pub fn kind(&self) -> ProbeKind {
        self.spec.kind()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| self.kind().default_timeout())
    }

    pub fn label(&self, target: &Target) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        match &self.spec {
            ProbeSpec::ContainerState { container, .. } => {
                format!("container {}", target.container_for(container))
            }
            ProbeSpec::TcpReachability { host, port } => {
                format!("tcp {}:{}", host.as_deref().unwrap_or(&target.host), port)
            }
            ProbeSpec::HttpStatus { url, .. } => format!("http {}", url),
            ProbeSpec::AuthenticatedApi { follow_up_url, .. } => {
                format!("auth {}", follow_up_url)
            }
            ProbeSpec::LogScan { container, .. } => {
                format!("logs {}", target.container_for(container))
            }
            ProbeSpec::Exec {
                container, command, ..
            } => format!(
                "exec {}: {}",
                target.container_for(container),
                command.join(" ")
            ),
        }
    }
}

/// Probe parameters, tagged by capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProbeSpec {
    ContainerState {
        #[serde(default)]
        container: Option<String>,
        /// A running container younger than this is not yet stable.
        #[serde(default)]
        min_uptime_secs: Option<u64>,
    },
    TcpReachability {
        #[serde(default)]
        host: Option<String>,
        port: u16,
    },
    HttpStatus {
        url: String,
        /// Tried in order when the previous URL fails at transport level.
        #[serde(default)]
        fallback_urls: Vec<String>,
        #[serde(default = "StatusSet::success_or_redirect")]
        expect: StatusSet,
    },
    AuthenticatedApi {
        login_url: String,
        credentials: Credentials,
        /// Key or JSON pointer of the token in the login response.
        #[serde(default = "default_token_field")]
        token_field: String,
        follow_up_url: String,
        #[serde(default)]
        expect: StatusSet,
    },
    LogScan {
        #[serde(default)]
        container: Option<String>,
        #[serde(default = "default_tail")]
        tail: u32,
        /// Replaces the target's vocabulary for this container only.
        #[serde(default)]
        indicators: Option<LogVocabulary>,
    },
    Exec {
        #[serde(default)]
        container: Option<String>,
        command: Vec<String>,
        /// Substring the output must contain (case-insensitive).
        expect: String,
    },
}

impl ProbeSpec {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeSpec::ContainerState { .. } => ProbeKind::ContainerState,
            ProbeSpec::TcpReachability { .. } => ProbeKind::TcpReachability,
            ProbeSpec::HttpStatus { .. } => ProbeKind::HttpStatus,
            ProbeSpec::AuthenticatedApi { .. } => ProbeKind::AuthenticatedApi,
            ProbeSpec::LogScan { .. } => ProbeKind::LogScan,
            ProbeSpec::Exec { .. } => ProbeKind::Exec,
        }
    }
}

/// Capability tag of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    ContainerState,
    TcpReachability,
    HttpStatus,
    AuthenticatedApi,
    LogScan,
    Exec,
}

impl ProbeKind {
    /// Probes that observe the service itself rather than its process or socket.
    pub fn is_functional(&self) -> bool {
        matches!(
            self,
            ProbeKind::HttpStatus | ProbeKind::AuthenticatedApi | ProbeKind::LogScan | ProbeKind::Exec
        )
    }

    /// Probes that touch the network or the service, as opposed to the runtime.
    pub fn is_network_level(&self) -> bool {
        !matches!(self, ProbeKind::ContainerState)
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            ProbeKind::TcpReachability => Duration::from_secs(5),
            ProbeKind::ContainerState | ProbeKind::LogScan => Duration::from_secs(10),
            ProbeKind::HttpStatus | ProbeKind::AuthenticatedApi => Duration::from_secs(10),
            ProbeKind::Exec => Duration::from_secs(30),
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeKind::ContainerState => "container-state",
            ProbeKind::TcpReachability => "tcp-reachability",
            ProbeKind::HttpStatus => "http-status",
            ProbeKind::AuthenticatedApi => "authenticated-api",
            ProbeKind::LogScan => "log-scan",
            ProbeKind::Exec => "exec",
        };
        write!(f, "{}", s)
    }
}

/// Credential payload posted to a login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum Credentials {
    Form { fields: BTreeMap<String, String> },
    Json { body: serde_json::Value },
}

/// Accepted HTTP status codes, as a union of inclusive ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StatusItem>", into = "Vec<String>")]
pub struct StatusSet(Vec<(u16, u16)>);

/// One accepted status entry: a single code or a `lo-hi` range.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum StatusItem {
    Code(u16),
    Range(String),
}

impl StatusSet {
    pub fn new(ranges: Vec<(u16, u16)>) -> Self {
        Self(ranges)
    }

    pub fn success_or_redirect() -> Self {
        Self(vec![(200, 399)])
    }

    pub fn contains(&self, status: u16) -> bool {
        self.0.iter().any(|(lo, hi)| (*lo..=*hi).contains(&status))
    }

    pub fn ranges(&self) -> &[(u16, u16)] {
        &self.0
    }
}

impl Default for StatusSet {
    fn default() -> Self {
        Self(vec![(200, 299)])
    }
}

impl TryFrom<Vec<StatusItem>> for StatusSet {
    type Error = String;

    fn try_from(items: Vec<StatusItem>) -> std::result::Result<Self, Self::Error> {
        let mut ranges = Vec::with_capacity(items.len());
        for item in items {
            match item {
                StatusItem::Code(code) => ranges.push((code, code)),
                StatusItem::Range(s) => {
                    let parse = |v: &str| {
                        v.trim()
                            .parse::<u16>()
                            .map_err(|_| format!("invalid status code in '{}'", s))
                    };
                    match s.split_once('-') {
                        Some((lo, hi)) => ranges.push((parse(lo)?, parse(hi)?)),
                        None => {
                            let code = parse(&s)?;
                            ranges.push((code, code));
                        }
                    }
                }
            }
        }
        Ok(Self(ranges))
    }
}

impl From<StatusSet> for Vec<String> {
    fn from(set: StatusSet) -> Self {
        set.0
            .into_iter()
            .map(|(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{}-{}", lo, hi)
                }
            })
            .collect()
    }
}

impl fmt::Display for StatusSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.clone().into();
        write!(f, "{}", parts.join(","))
    }
}

/// Log-indicator vocabulary for the log-scan probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogVocabulary {
    #[serde(default)]
    pub good: Vec<String>,
    #[serde(default)]
    pub bad: Vec<String>,
    /// Case-insensitive regexes treated like bad substrings.
    #[serde(default)]
    pub bad_patterns: Vec<Pattern>,
}

/// Outcome of scanning a log tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogScan {
    pub good: Vec<String>,
    pub bad: Vec<String>,
}

impl LogVocabulary {
    pub fn is_empty(&self) -> bool {
        self.good.is_empty() && self.bad.is_empty() && self.bad_patterns.is_empty()
    }

    /// Case-insensitive scan of `text` for every indicator.
    pub fn scan(&self, text: &str) -> LogScan {
        let haystack = text.to_lowercase();
        let good = self
            .good
            .iter()
            .filter(|i| haystack.contains(&i.to_lowercase()))
            .cloned()
            .collect();
        let mut bad: Vec<String> = self
            .bad
            .iter()
            .filter(|i| haystack.contains(&i.to_lowercase()))
            .cloned()
            .collect();
        bad.extend(
            self.bad_patterns
                .iter()
                .filter(|p| p.regex.is_match(text))
                .map(|p| p.source.clone()),
        );
        LogScan { good, bad }
    }
}

/// A case-insensitive regex kept alongside its source text.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self> {
        let regex = RegexBuilder::new(source)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Configuration(format!("invalid pattern '{}': {}", source, e)))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl Serialize for Pattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}
