//! Target registry: the static set of targets a session can verify.
//!
//! Targets are declared as data (YAML or JSON). The registry resolves
//! endpoint placeholders from provisioner outputs, applies command-line
//! poll overrides, and validates everything before any polling starts.

use crate::report::SkippedTarget;
use crate::target::{valid_secs, ProbeSpec, Target, MAX_SECS};
use readycheck_common::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").unwrap());

const BUILTIN: &str = include_str!("../registry/default.yaml");

/// Immutable mapping of target name to its declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetRegistry {
    targets: Vec<Target>,
}

/// Targets chosen for one session, plus those left out.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub targets: Vec<Arc<Target>>,
    pub skipped: Vec<SkippedTarget>,
}

impl TargetRegistry {
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    /// The registry shipped with the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid registry: {}", e)))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid registry: {}", e)))
    }

    /// Load a registry file; `.json` files are JSON, anything else YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        };
        parsed.map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Names of every `${name}` placeholder referenced by an endpoint.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for target in &self.targets {
            for field in endpoints(target) {
                for caps in PLACEHOLDER.captures_iter(field) {
                    names.insert(caps[1].to_string());
                }
            }
        }
        names
    }

    /// Substitute `${name}` placeholders with provisioner outputs.
    ///
    /// Placeholders with no matching output are left in place and reported
    /// by [`validate`](Self::validate).
    pub fn resolve_endpoints(&mut self, outputs: &BTreeMap<String, String>) {
        for target in &mut self.targets {
            for field in endpoints_mut(target) {
                if !field.contains("${") {
                    continue;
                }
                let resolved = PLACEHOLDER.replace_all(field.as_str(), |caps: &regex::Captures| {
                    outputs
                        .get(&caps[1])
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string())
                });
                *field = resolved.into_owned();
            }
        }
    }

    /// Apply `--deadline`/`--delay` overrides. Global values apply first so
    /// that per-target values win.
    pub fn apply_overrides(
        &mut self,
        deadlines: &[PollOverride],
        delays: &[PollOverride],
    ) -> Result<()> {
        let mut problems = Vec::new();
        for o in deadlines.iter().chain(delays) {
            if let Some(name) = &o.target {
                if self.get(name).is_none() {
                    problems.push(format!("override for unknown target '{}'", name));
                }
            }
        }
        if !problems.is_empty() {
            return Err(Error::Configuration(problems.join("; ")));
        }

        let ordered = |list: &[PollOverride]| -> Vec<PollOverride> {
            let mut list = list.to_vec();
            list.sort_by_key(|o| o.target.is_some());
            list
        };
        for o in ordered(deadlines) {
            for target in self.matching(&o) {
                target.poll.deadline_secs = o.seconds;
            }
        }
        for o in ordered(delays) {
            for target in self.matching(&o) {
                target.poll.delay_secs = o.seconds;
            }
        }
        Ok(())
    }

    fn matching<'a>(&'a mut self, o: &'a PollOverride) -> impl Iterator<Item = &'a mut Target> {
        self.targets
            .iter_mut()
            .filter(move |t| o.target.as_ref().map_or(true, |name| *name == t.name))
    }

    /// Check every declaration, reporting all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();

        if self.targets.is_empty() {
            problems.push("registry declares no targets".to_string());
        }
        for target in &self.targets {
            if !seen.insert(target.name.as_str()) {
                problems.push(format!("duplicate target '{}'", target.name));
            }
            problems.extend(
                validate_target(target)
                    .into_iter()
                    .map(|p| format!("{}: {}", target.name, p)),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(problems.join("; ")))
        }
    }

    /// Pick targets by name (all when `names` is empty). Short mode skips
    /// slow targets entirely.
    pub fn select(&self, names: &[String], short: bool) -> Result<Selection> {
        let chosen: Vec<&Target> = if names.is_empty() {
            self.targets.iter().collect()
        } else {
            let unknown: Vec<&str> = names
                .iter()
                .filter(|n| self.get(n).is_none())
                .map(String::as_str)
                .collect();
            if !unknown.is_empty() {
                return Err(Error::Configuration(format!(
                    "unknown target(s): {}",
                    unknown.join(", ")
                )));
            }
            let mut seen = HashSet::new();
            names
                .iter()
                .filter(|n| seen.insert(n.as_str()))
                .filter_map(|n| self.get(n))
                .collect()
        };

        let mut selection = Selection::default();
        for target in chosen {
            if short && target.slow {
                selection.skipped.push(SkippedTarget {
                    target: target.name.clone(),
                    reason: "slow deployment check skipped in short mode".to_string(),
                });
            } else {
                selection.targets.push(Arc::new(target.clone()));
            }
        }
        Ok(selection)
    }
}

fn validate_target(target: &Target) -> Vec<String> {
    let mut problems = Vec::new();

    if target.probes.is_empty() {
        problems.push("no probes declared".to_string());
    } else if !target.probes.iter().any(|p| p.kind().is_network_level()) {
        problems.push("no network-level probe; the target could never become healthy".to_string());
    }

    let poll = &target.poll;
    if !valid_secs(poll.deadline_secs) {
        problems.push(format!(
            "deadline must be between 0 and {}s, got {}",
            MAX_SECS, poll.deadline_secs
        ));
    }
    if !valid_secs(poll.delay_secs) {
        problems.push(format!(
            "delay must be between 0 and {}s, got {}",
            MAX_SECS, poll.delay_secs
        ));
    } else if poll.delay_secs > poll.deadline_secs {
        problems.push(format!(
            "delay {}s exceeds deadline {}s",
            poll.delay_secs, poll.deadline_secs
        ));
    }

    let mut tcp_ports = HashSet::new();
    for decl in &target.probes {
        if decl.timeout_secs.is_some_and(|t| !valid_secs(t)) {
            problems.push(format!(
                "{}: timeout must be between 0 and {}s",
                decl.label(target),
                MAX_SECS
            ));
        }
        match &decl.spec {
            ProbeSpec::ContainerState { .. } => {}
            ProbeSpec::TcpReachability { port, .. } => {
                if *port == 0 {
                    problems.push("tcp-reachability probe on port 0".to_string());
                }
                tcp_ports.insert(*port);
            }
            ProbeSpec::HttpStatus {
                url,
                fallback_urls,
                expect,
            } => {
                for u in std::iter::once(url).chain(fallback_urls) {
                    problems.extend(check_url(u));
                }
                problems.extend(check_ranges(expect.ranges()));
            }
            ProbeSpec::AuthenticatedApi {
                login_url,
                token_field,
                follow_up_url,
                expect,
                ..
            } => {
                problems.extend(check_url(login_url));
                problems.extend(check_url(follow_up_url));
                if token_field.trim().is_empty() {
                    problems.push("authenticated-api probe with empty token field".to_string());
                }
                problems.extend(check_ranges(expect.ranges()));
            }
            ProbeSpec::LogScan { indicators, .. } => {
                if target.vocabulary_for(indicators).good.is_empty() {
                    problems.push("log-scan probe without good indicators".to_string());
                }
            }
            ProbeSpec::Exec {
                command, expect, ..
            } => {
                if command.is_empty() {
                    problems.push("exec probe with empty command".to_string());
                }
                if expect.is_empty() {
                    problems.push("exec probe with empty expected output".to_string());
                }
            }
        }
    }

    for port in &target.expected_ports {
        if *port == 0 {
            problems.push("expected port 0".to_string());
        } else if !tcp_ports.contains(port) {
            problems.push(format!(
                "expected port {} has no tcp-reachability probe",
                port
            ));
        }
    }

    for field in endpoints(target) {
        for caps in PLACEHOLDER.captures_iter(field) {
            problems.push(format!("unresolved placeholder '{}'", &caps[0]));
        }
    }
    problems
}

fn check_url(url: &str) -> Option<String> {
    if PLACEHOLDER.is_match(url) {
        return None;
    }
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => None,
        Ok(parsed) => Some(format!("unsupported scheme '{}' in {}", parsed.scheme(), url)),
        Err(e) => Some(format!("invalid URL '{}': {}", url, e)),
    }
}

fn check_ranges(ranges: &[(u16, u16)]) -> Option<String> {
    if ranges.is_empty() {
        return Some("empty accepted status set".to_string());
    }
    ranges
        .iter()
        .find(|(lo, hi)| lo > hi || *lo < 100 || *hi > 599)
        .map(|(lo, hi)| format!("invalid status range {}-{}", lo, hi))
}

fn endpoints(target: &Target) -> Vec<&str> {
    let mut fields = vec![target.host.as_str()];
    for decl in &target.probes {
        match &decl.spec {
            ProbeSpec::TcpReachability {
                host: Some(host), ..
            } => fields.push(host),
            ProbeSpec::HttpStatus {
                url, fallback_urls, ..
            } => {
                fields.push(url);
                fields.extend(fallback_urls.iter().map(String::as_str));
            }
            ProbeSpec::AuthenticatedApi {
                login_url,
                follow_up_url,
                ..
            } => {
                fields.push(login_url);
                fields.push(follow_up_url);
            }
            _ => {}
        }
    }
    fields
}

fn endpoints_mut(target: &mut Target) -> Vec<&mut String> {
    let mut fields = vec![&mut target.host];
    for decl in &mut target.probes {
        match &mut decl.spec {
            ProbeSpec::TcpReachability {
                host: Some(host), ..
            } => fields.push(host),
            ProbeSpec::HttpStatus {
                url, fallback_urls, ..
            } => {
                fields.push(url);
                fields.extend(fallback_urls.iter_mut());
            }
            ProbeSpec::AuthenticatedApi {
                login_url,
                follow_up_url,
                ..
            } => {
                fields.push(login_url);
                fields.push(follow_up_url);
            }
            _ => {}
        }
    }
    fields
}

/// A `--deadline`/`--delay` value: `SECS` for every target or `NAME=SECS`.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOverride {
    pub target: Option<String>,
    pub seconds: f64,
}

impl FromStr for PollOverride {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (target, value) = match s.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                (Some(name.trim().to_string()), value)
            }
            Some(_) => {
                return Err(Error::Configuration(format!(
                    "missing target name in '{}'",
                    s
                )))
            }
            None => (None, s),
        };
        let seconds: f64 = value
            .trim()
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid seconds in '{}'", s)))?;
        if !valid_secs(seconds) {
            return Err(Error::Configuration(format!(
                "seconds must be between 0 and {} in '{}'",
                MAX_SECS, s
            )));
        }
        Ok(Self { target, seconds })
    }
}
