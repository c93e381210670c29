//! Retry/poll loop: drives probe-and-aggregate cycles for one target.
//!
//! `Polling -> {Healthy, Unhealthy, TimedOut}`. The loop owns its deadline:
//! an attempt still running when it passes is abandoned. An explicit
//! Unhealthy verdict ends the loop early. An external cancellation ends it
//! as a timeout.

use crate::aggregate::{aggregate, Assessment, Verdict};
use crate::probe::{run_probe, ProbeContext, ProbeResult};
use crate::report::{Termination, TargetReport};
use crate::target::Target;
use std::future::Future;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run the target's probes once, sequentially, in declared order.
pub async fn run_attempt(ctx: &ProbeContext, target: &Target) -> Vec<ProbeResult> {
    let mut results = Vec::with_capacity(target.probes.len());
    for decl in &target.probes {
        results.push(run_probe(ctx, target, decl).await);
    }
    results
}

/// Poll `target` until it reaches a terminal state.
pub async fn poll_target(
    ctx: &ProbeContext,
    target: &Target,
    cancel: &CancellationToken,
) -> TargetReport {
    poll_with(target, cancel, || run_attempt(ctx, target)).await
}

/// The poll state machine, generic over how one attempt is produced.
pub async fn poll_with<F, Fut>(
    target: &Target,
    cancel: &CancellationToken,
    mut attempt: F,
) -> TargetReport
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Vec<ProbeResult>>,
{
    let started = Instant::now();
    let deadline = started + target.poll.deadline();
    let delay = target.poll.delay();
    let mut attempts = 0u32;
    let mut last: Option<(Assessment, Vec<ProbeResult>)> = None;

    info!(
        target_name = %target.name,
        deadline_secs = target.poll.deadline_secs,
        delay_secs = target.poll.delay_secs,
        "Polling target"
    );

    loop {
        attempts += 1;
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return finish(target, Termination::Cancelled, attempts - 1, started, last);
            }
            results = attempt() => results,
            _ = sleep_until(deadline) => {
                return finish(target, Termination::TimedOut, attempts - 1, started, last);
            }
        };

        let assessment = aggregate(&results, target.runtime_health);
        debug!(
            target_name = %target.name,
            attempt = attempts,
            verdict = %assessment.verdict,
            "{}",
            assessment.reason
        );

        let termination = match assessment.verdict {
            Verdict::Healthy => Some(Termination::Ready),
            Verdict::Unhealthy if assessment.fast_fail => Some(Termination::FastFail),
            Verdict::Unhealthy => Some(Termination::ExplicitNegative),
            Verdict::Indeterminate => None,
        };
        last = Some((assessment, results));
        if let Some(termination) = termination {
            return finish(target, termination, attempts, started, last);
        }

        if Instant::now() + delay > deadline {
            return finish(target, Termination::TimedOut, attempts, started, last);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return finish(target, Termination::Cancelled, attempts, started, last);
            }
            _ = sleep(delay) => {}
        }
    }
}

fn finish(
    target: &Target,
    termination: Termination,
    attempts: u32,
    started: Instant,
    last: Option<(Assessment, Vec<ProbeResult>)>,
) -> TargetReport {
    let (reason, probes) = match last {
        Some((assessment, probes)) => (assessment.reason, probes),
        None => ("no attempt completed".to_string(), Vec::new()),
    };
    let reason = match termination {
        Termination::TimedOut => format!(
            "not ready after {:.0}s: {}",
            target.poll.deadline_secs, reason
        ),
        Termination::Cancelled => format!("cancelled: {}", reason),
        _ => reason,
    };

    let report = TargetReport::new(
        &target.name,
        termination,
        reason,
        attempts,
        started.elapsed(),
        probes,
    );
    if report.passed() {
        info!(
            target_name = %target.name,
            attempts,
            elapsed_ms = report.elapsed_ms,
            "Target is healthy"
        );
    } else {
        warn!(
            target_name = %target.name,
            attempts,
            termination = ?termination,
            "Target is not healthy: {}",
            report.reason
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ContainerObservation, Outcome};
    use crate::runtime::testing::{container, FakeRuntime};
    use crate::runtime::{ContainerState, ExecOutput, HealthStatus};
    use crate::target::{
        HealthPolicy, LogVocabulary, PollSettings, ProbeDecl, ProbeKind, ProbeSpec,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn target(deadline_secs: f64, delay_secs: f64) -> Target {
        Target {
            name: "x".to_string(),
            description: None,
            host: "127.0.0.1".to_string(),
            expected_ports: vec![1337],
            probes: vec![],
            log_indicators: LogVocabulary::default(),
            runtime_health: HealthPolicy::Override,
            slow: false,
            poll: PollSettings {
                deadline_secs,
                delay_secs,
            },
        }
    }

    fn tcp(outcome: Outcome) -> ProbeResult {
        ProbeResult {
            label: "tcp 127.0.0.1:1337".into(),
            kind: ProbeKind::TcpReachability,
            outcome,
            detail: None,
            status_code: None,
            matched: vec![],
            container: None,
            elapsed_ms: 0,
        }
    }

    fn exec(exit_code: Option<i32>, output: &str) -> ExecOutput {
        ExecOutput {
            exit_code,
            output: output.to_string(),
        }
    }

    fn stopped() -> ProbeResult {
        ProbeResult {
            label: "container x".into(),
            kind: ProbeKind::ContainerState,
            outcome: Outcome::Failure,
            detail: Some("container state is exited".into()),
            status_code: None,
            matched: vec![],
            container: Some(ContainerObservation {
                container: "x".into(),
                state: ContainerState::Exited,
                health: None,
            }),
            elapsed_ms: 0,
        }
    }

    fn running_unhealthy() -> ProbeResult {
        ProbeResult {
            label: "container x".into(),
            kind: ProbeKind::ContainerState,
            outcome: Outcome::Success,
            detail: Some("running, runtime health unhealthy".into()),
            status_code: None,
            matched: vec![],
            container: Some(ContainerObservation {
                container: "x".into(),
                state: ContainerState::Running,
                health: Some(HealthStatus::Unhealthy),
            }),
            elapsed_ms: 0,
        }
    }

    fn http(outcome: Outcome) -> ProbeResult {
        ProbeResult {
            label: "http https://127.0.0.1:8443/".into(),
            kind: ProbeKind::HttpStatus,
            outcome,
            detail: None,
            status_code: None,
            matched: vec![],
            container: None,
            elapsed_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_opens_after_ten_seconds() {
        let target = target(30.0, 2.0);
        let cancel = CancellationToken::new();
        let opened_at = Instant::now() + Duration::from_secs(10);

        let report = poll_with(&target, &cancel, || async move {
            if Instant::now() >= opened_at {
                vec![tcp(Outcome::Success)]
            } else {
                vec![tcp(Outcome::Failure)]
            }
        })
        .await;

        assert_eq!(report.termination, Termination::Ready);
        assert_eq!(report.verdict, Verdict::Healthy);
        assert!((5..=6).contains(&report.attempts), "{}", report.attempts);
        assert_eq!(report.probes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_container_fails_fast() {
        let target = target(300.0, 5.0);
        let cancel = CancellationToken::new();

        let report = poll_with(&target, &cancel, || async {
            vec![stopped(), tcp(Outcome::Failure)]
        })
        .await;

        assert_eq!(report.termination, Termination::FastFail);
        assert_eq!(report.verdict, Verdict::Unhealthy);
        assert_eq!(report.attempts, 1);
        assert!(report.elapsed_ms < 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_with_failing_recheck_stops_at_once() {
        for policy in [HealthPolicy::Override, HealthPolicy::Strict] {
            let mut target = target(300.0, 3.0);
            target.runtime_health = policy;
            let cancel = CancellationToken::new();

            let report = poll_with(&target, &cancel, || async {
                vec![running_unhealthy(), tcp(Outcome::Success), http(Outcome::Failure)]
            })
            .await;

            assert_eq!(report.termination, Termination::ExplicitNegative, "{:?}", policy);
            assert_eq!(report.verdict, Verdict::Unhealthy);
            assert_eq!(report.attempts, 1);
            assert!(report.elapsed_ms < 1000);
            assert!(!report.fast_failed());
            assert!(!report.timed_out());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_policy_ignores_passing_recheck() {
        let mut target = target(300.0, 3.0);
        target.runtime_health = HealthPolicy::Strict;
        let cancel = CancellationToken::new();

        let report = poll_with(&target, &cancel, || async {
            vec![running_unhealthy(), tcp(Outcome::Success), http(Outcome::Success)]
        })
        .await;

        assert_eq!(report.termination, Termination::ExplicitNegative);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_is_cut_at_deadline() {
        let target = target(30.0, 2.0);
        let cancel = CancellationToken::new();

        let report = poll_with(&target, &cancel, || async {
            sleep(Duration::from_secs(20)).await;
            vec![tcp(Outcome::Failure)]
        })
        .await;

        assert_eq!(report.termination, Termination::TimedOut);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.elapsed_ms, 30_000);
        assert_eq!(report.probes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out_at_deadline() {
        let target = target(30.0, 2.0);
        let cancel = CancellationToken::new();

        let report = poll_with(&target, &cancel, || async { vec![tcp(Outcome::Failure)] }).await;

        assert_eq!(report.termination, Termination::TimedOut);
        assert_eq!(report.verdict, Verdict::Unhealthy);
        assert!(report.timed_out());
        assert!(report.elapsed_ms <= 30_000);
        assert!(report.elapsed_ms >= 28_000);
        assert_eq!(report.attempts, 16);
        assert!(report.reason.starts_with("not ready after 30s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_records_timeout() {
        let target = target(300.0, 5.0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let report = poll_with(&target, &cancel, || async { vec![tcp(Outcome::Failure)] }).await;

        assert_eq!(report.termination, Termination::Cancelled);
        assert!(report.timed_out());
        assert!(report.elapsed_ms < 20_000);
        assert!(report.reason.starts_with("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_target_with_runtime_probes() {
        let runtime = FakeRuntime::new();
        runtime
            .push_inspect("x", Ok(container("x", "restarting", None)))
            .push_inspect("x", Ok(container("x", "running", None)));
        runtime
            .push_exec("x", Ok(exec(Some(1), "starting")))
            .push_exec("x", Ok(exec(Some(0), "ready")));
        let ctx = ProbeContext::new(Arc::new(runtime)).unwrap();

        let mut t = target(60.0, 3.0);
        t.probes = vec![
            ProbeDecl::new(ProbeSpec::ContainerState {
                container: None,
                min_uptime_secs: None,
            }),
            ProbeDecl::new(ProbeSpec::Exec {
                container: None,
                command: vec!["status".into()],
                expect: "ready".into(),
            }),
        ];

        let report = poll_target(&ctx, &t, &CancellationToken::new()).await;
        assert_eq!(report.termination, Termination::Ready);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.probes[0].kind, ProbeKind::ContainerState);
        assert_eq!(report.probes[1].kind, ProbeKind::Exec);
    }
}
