//! Signal aggregation: one tri-state verdict from one attempt's probe results.

use crate::probe::ProbeResult;
use crate::runtime::HealthStatus;
use crate::target::{HealthPolicy, ProbeKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Readiness of one target at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    /// An explicit negative signal was observed.
    Unhealthy,
    /// Not enough signal yet; keep polling.
    Indeterminate,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Healthy => write!(f, "healthy"),
            Verdict::Unhealthy => write!(f, "unhealthy"),
            Verdict::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Verdict plus what produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub verdict: Verdict,
    /// Set when a container reported a terminal state; polling stops at once.
    pub fast_fail: bool,
    pub reason: String,
}

impl Assessment {
    fn healthy(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Healthy,
            fast_fail: false,
            reason: reason.into(),
        }
    }

    fn unhealthy(reason: impl Into<String>, fast_fail: bool) -> Self {
        Self {
            verdict: Verdict::Unhealthy,
            fast_fail,
            reason: reason.into(),
        }
    }

    fn indeterminate(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Indeterminate,
            fast_fail: false,
            reason: reason.into(),
        }
    }
}

/// Reconcile one attempt's probe results into a verdict.
///
/// Precedence:
/// 1. a container in a terminal state is Unhealthy (fast-fail);
/// 2. the functional check passes when every tcp-reachability probe
///    succeeded and at least one functional probe succeeded, or, with no
///    functional probe configured, when at least one tcp probe ran and all
///    succeeded;
/// 3. an `unhealthy` runtime health descriptor is overridden by a passing
///    functional check (unless the policy is strict), otherwise Unhealthy;
/// 4. a `healthy` descriptor alone is never enough;
/// 5. anything else is Indeterminate.
///
/// Pure: the same results always give the same assessment.
pub fn aggregate(results: &[ProbeResult], policy: HealthPolicy) -> Assessment {
    if let Some(stopped) = results
        .iter()
        .filter_map(|r| r.container.as_ref())
        .find(|c| c.state.is_terminal())
    {
        return Assessment::unhealthy(
            format!("container {} is {}", stopped.container, stopped.state),
            true,
        );
    }

    let containers_ok = results
        .iter()
        .filter(|r| r.kind == ProbeKind::ContainerState)
        .all(ProbeResult::is_success);

    let tcp: Vec<&ProbeResult> = results
        .iter()
        .filter(|r| r.kind == ProbeKind::TcpReachability)
        .collect();
    let tcp_ok = tcp.iter().all(|r| r.is_success());

    let functional: Vec<&ProbeResult> = results.iter().filter(|r| r.kind.is_functional()).collect();
    let functional_pass = tcp_ok
        && if functional.is_empty() {
            !tcp.is_empty()
        } else {
            functional.iter().any(|r| r.is_success())
        };

    let descriptor = runtime_health(results);

    if descriptor == Some(HealthStatus::Unhealthy) {
        if policy == HealthPolicy::Strict {
            return Assessment::unhealthy("runtime health check reports unhealthy", false);
        }
        if functional_pass && containers_ok {
            return Assessment::healthy(
                "functional checks pass despite unhealthy runtime health check",
            );
        }
        return Assessment::unhealthy(
            format!(
                "runtime health check reports unhealthy and functional re-check failed: {}",
                pending(results)
            ),
            false,
        );
    }

    if functional_pass && containers_ok {
        let reason = match descriptor {
            Some(HealthStatus::Healthy) => "runtime health and functional checks pass",
            _ => "functional checks pass",
        };
        return Assessment::healthy(reason);
    }

    Assessment::indeterminate(format!("waiting on {}", pending(results)))
}

/// Worst runtime health descriptor reported by any container probe.
fn runtime_health(results: &[ProbeResult]) -> Option<HealthStatus> {
    let statuses: Vec<HealthStatus> = results
        .iter()
        .filter_map(|r| r.container.as_ref().and_then(|c| c.health))
        .filter(|s| *s != HealthStatus::None)
        .collect();

    [
        HealthStatus::Unhealthy,
        HealthStatus::Starting,
        HealthStatus::Healthy,
    ]
    .into_iter()
    .find(|s| statuses.contains(s))
}

fn pending(results: &[ProbeResult]) -> String {
    let waiting: Vec<&str> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.label.as_str())
        .collect();
    if waiting.is_empty() {
        "a functional signal".to_string()
    } else {
        waiting.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ContainerObservation, Outcome};
    use crate::runtime::ContainerState;

    fn result(kind: ProbeKind, outcome: Outcome) -> ProbeResult {
        ProbeResult {
            label: format!("{}", kind),
            kind,
            outcome,
            detail: None,
            status_code: None,
            matched: vec![],
            container: None,
            elapsed_ms: 1,
        }
    }

    fn container(state: &str, health: Option<HealthStatus>) -> ProbeResult {
        let state = ContainerState::parse(state);
        let outcome = if state == ContainerState::Running {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        ProbeResult {
            container: Some(ContainerObservation {
                container: "svc".into(),
                state,
                health,
            }),
            ..result(ProbeKind::ContainerState, outcome)
        }
    }

    use Outcome::{Failure, NotApplicable, Success};
    use ProbeKind::{HttpStatus, LogScan, TcpReachability};

    #[test]
    fn test_exited_container_fast_fails() {
        let results = vec![
            container("exited", None),
            result(TcpReachability, Success),
            result(HttpStatus, Success),
        ];
        let a = aggregate(&results, HealthPolicy::Override);
        assert_eq!(a.verdict, Verdict::Unhealthy);
        assert!(a.fast_fail);
        assert!(a.reason.contains("exited"));
    }

    #[test]
    fn test_restarting_container_is_not_fast_fail() {
        let results = vec![container("restarting", None), result(TcpReachability, Failure)];
        let a = aggregate(&results, HealthPolicy::Override);
        assert_eq!(a.verdict, Verdict::Indeterminate);
    }

    #[test]
    fn test_container_running_alone_is_never_healthy() {
        let results = vec![container("running", Some(HealthStatus::Healthy))];
        assert_eq!(
            aggregate(&results, HealthPolicy::Override).verdict,
            Verdict::Indeterminate
        );
    }

    #[test]
    fn test_tcp_only_target_is_healthy_when_all_ports_open() {
        let results = vec![
            container("running", None),
            result(TcpReachability, Success),
            result(TcpReachability, Success),
        ];
        assert_eq!(
            aggregate(&results, HealthPolicy::Override).verdict,
            Verdict::Healthy
        );

        let one_closed = vec![result(TcpReachability, Success), result(TcpReachability, Failure)];
        assert_eq!(
            aggregate(&one_closed, HealthPolicy::Override).verdict,
            Verdict::Indeterminate
        );
    }

    #[test]
    fn test_tcp_success_is_not_enough_when_functional_probes_exist() {
        let results = vec![
            result(TcpReachability, Success),
            result(HttpStatus, Failure),
            result(LogScan, NotApplicable),
        ];
        assert_eq!(
            aggregate(&results, HealthPolicy::Override).verdict,
            Verdict::Indeterminate
        );
    }

    #[test]
    fn test_one_functional_success_suffices() {
        let results = vec![
            container("running", None),
            result(TcpReachability, Success),
            result(HttpStatus, Failure),
            result(LogScan, Success),
        ];
        assert_eq!(
            aggregate(&results, HealthPolicy::Override).verdict,
            Verdict::Healthy
        );
    }

    #[test]
    fn test_unhealthy_descriptor_overridden_by_functional_signal() {
        let results = vec![
            container("running", Some(HealthStatus::Unhealthy)),
            result(TcpReachability, Success),
            result(HttpStatus, Success),
        ];
        let a = aggregate(&results, HealthPolicy::Override);
        assert_eq!(a.verdict, Verdict::Healthy);
        assert!(!a.fast_fail);
    }

    #[test]
    fn test_unhealthy_descriptor_with_failing_recheck() {
        let results = vec![
            container("running", Some(HealthStatus::Unhealthy)),
            result(TcpReachability, Failure),
            result(HttpStatus, Failure),
        ];
        let a = aggregate(&results, HealthPolicy::Override);
        assert_eq!(a.verdict, Verdict::Unhealthy);
        assert!(!a.fast_fail);
    }

    #[test]
    fn test_strict_policy_trusts_descriptor() {
        let results = vec![
            container("running", Some(HealthStatus::Unhealthy)),
            result(TcpReachability, Success),
            result(HttpStatus, Success),
        ];
        assert_eq!(
            aggregate(&results, HealthPolicy::Strict).verdict,
            Verdict::Unhealthy
        );
    }

    #[test]
    fn test_healthy_descriptor_still_needs_functional_signal() {
        let results = vec![
            container("running", Some(HealthStatus::Healthy)),
            result(TcpReachability, Success),
            result(HttpStatus, Failure),
        ];
        assert_eq!(
            aggregate(&results, HealthPolicy::Override).verdict,
            Verdict::Indeterminate
        );
    }

    #[test]
    fn test_empty_log_tail_never_yields_unhealthy() {
        let results = vec![
            container("running", None),
            result(TcpReachability, Success),
            result(LogScan, NotApplicable),
        ];
        assert_eq!(
            aggregate(&results, HealthPolicy::Override).verdict,
            Verdict::Indeterminate
        );
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let results = vec![
            container("running", Some(HealthStatus::Starting)),
            result(TcpReachability, Success),
            result(HttpStatus, Failure),
        ];
        let first = aggregate(&results, HealthPolicy::Override);
        let second = aggregate(&results, HealthPolicy::Override);
        assert_eq!(first, second);
    }

    #[test]
    fn test_healthy_always_backed_by_network_signal() {
        // Exhaustive over small combinations of outcomes.
        let outcomes = [Success, Failure, NotApplicable];
        for tcp in outcomes {
            for http in outcomes {
                for logs in outcomes {
                    let results = vec![
                        container("running", Some(HealthStatus::Unhealthy)),
                        result(TcpReachability, tcp),
                        result(HttpStatus, http),
                        result(LogScan, logs),
                    ];
                    let a = aggregate(&results, HealthPolicy::Override);
                    if a.verdict == Verdict::Healthy {
                        assert!(results
                            .iter()
                            .any(|r| r.kind.is_functional() && r.is_success()));
                    }
                }
            }
        }
    }
}
