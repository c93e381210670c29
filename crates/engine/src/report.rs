//! Verification reports: per-target outcomes and the session summary.

use crate::aggregate::Verdict;
use crate::probe::{Outcome, ProbeResult};
use readycheck_common::{Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

/// How a target's poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Aggregation produced Healthy.
    Ready,
    /// A container reached a terminal state.
    FastFail,
    /// An explicit Unhealthy verdict from a container that is still running.
    ExplicitNegative,
    /// The deadline passed without a Healthy verdict.
    TimedOut,
    /// The session was cancelled while this target was polling.
    Cancelled,
}

/// Terminal outcome of one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetReport {
    pub target: String,
    /// Healthy or Unhealthy; never Indeterminate.
    pub verdict: Verdict,
    pub termination: Termination,
    pub reason: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// Probe results of the last completed attempt.
    pub probes: Vec<ProbeResult>,
}

impl TargetReport {
    pub fn new(
        target: &str,
        termination: Termination,
        reason: String,
        attempts: u32,
        elapsed: Duration,
        probes: Vec<ProbeResult>,
    ) -> Self {
        let verdict = match termination {
            Termination::Ready => Verdict::Healthy,
            _ => Verdict::Unhealthy,
        };
        Self {
            target: target.to_string(),
            verdict,
            termination,
            reason,
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
            probes,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Healthy
    }

    pub fn timed_out(&self) -> bool {
        matches!(
            self.termination,
            Termination::TimedOut | Termination::Cancelled
        )
    }

    pub fn fast_failed(&self) -> bool {
        self.termination == Termination::FastFail
    }

    fn status(&self) -> &'static str {
        match self.termination {
            Termination::Ready => "PASS",
            Termination::FastFail => "FAIL",
            Termination::ExplicitNegative => "FAIL",
            Termination::TimedOut => "TIMEOUT",
            Termination::Cancelled => "CANCELLED",
        }
    }
}

/// Target left out of a session, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTarget {
    pub target: String,
    pub reason: String,
}

/// Result of one verification session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub elapsed_ms: u64,
    /// Target reports in arrival order.
    pub targets: Vec<TargetReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedTarget>,
}

impl SessionReport {
    pub fn passed(&self) -> usize {
        self.targets.iter().filter(|t| t.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.targets.len() - self.passed()
    }

    /// True when every verified target is Healthy. Skipped targets don't count.
    pub fn all_healthy(&self) -> bool {
        self.targets.iter().all(TargetReport::passed)
    }

    pub fn get(&self, target: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.target == target)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable summary table followed by probe outcomes of failing
    /// targets, or of every target when `detailed`.
    pub fn render_text(&self, detailed: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Readiness Verification ({}) ===\n", self.session_id);
        let _ = writeln!(out, "Summary:");
        let _ = writeln!(out, "  Total:   {}", self.targets.len());
        let _ = writeln!(out, "  Healthy: {}", self.passed());
        let _ = writeln!(out, "  Failed:  {}", self.failed());
        if !self.skipped.is_empty() {
            let _ = writeln!(out, "  Skipped: {}", self.skipped.len());
        }
        let _ = writeln!(
            out,
            "  Elapsed: {:.1}s\n",
            self.elapsed_ms as f64 / 1000.0
        );

        let _ = writeln!(out, "{:-<72}", "");
        let _ = writeln!(
            out,
            "{:<30} {:>10} {:>10} {:>10}",
            "Target", "Status", "Attempts", "Time(s)"
        );
        let _ = writeln!(out, "{:-<72}", "");
        for report in &self.targets {
            let name: String = report.target.chars().take(30).collect();
            let _ = writeln!(
                out,
                "{:<30} {:>10} {:>10} {:>10.1}",
                name,
                report.status(),
                report.attempts,
                report.elapsed_ms as f64 / 1000.0
            );
        }
        let _ = writeln!(out, "{:-<72}", "");

        let shown: Vec<&TargetReport> = self
            .targets
            .iter()
            .filter(|t| detailed || !t.passed())
            .collect();
        if !shown.is_empty() {
            let _ = writeln!(out, "\n{}:", if detailed { "Details" } else { "Failures" });
            for report in shown {
                let _ = writeln!(out, "\n  {}: {}", report.target, report.reason);
                for probe in &report.probes {
                    let mark = match probe.outcome {
                        Outcome::Success => "ok",
                        Outcome::Failure => "FAIL",
                        Outcome::NotApplicable => "n/a",
                    };
                    let _ = write!(out, "    [{:>4}] {}", mark, probe.label);
                    if let Some(detail) = &probe.detail {
                        let _ = write!(out, " ({})", detail);
                    }
                    let _ = writeln!(out);
                }
            }
        }

        if !self.skipped.is_empty() {
            let _ = writeln!(out, "\nSkipped:");
            for skipped in &self.skipped {
                let _ = writeln!(out, "  {}: {}", skipped.target, skipped.reason);
            }
        }
        out
    }

    /// Write the JSON form of the report to `path`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ProbeKind;
    use pretty_assertions::assert_eq;

    fn probe(label: &str, outcome: Outcome, detail: Option<&str>) -> ProbeResult {
        ProbeResult {
            label: label.to_string(),
            kind: ProbeKind::TcpReachability,
            outcome,
            detail: detail.map(str::to_string),
            status_code: None,
            matched: vec![],
            container: None,
            elapsed_ms: 3,
        }
    }

    fn session(targets: Vec<TargetReport>) -> SessionReport {
        SessionReport {
            session_id: "test".to_string(),
            started_at: Timestamp::now(),
            finished_at: Timestamp::now(),
            elapsed_ms: 30_000,
            targets,
            skipped: vec![],
        }
    }

    #[test]
    fn test_verdict_follows_termination() {
        let ready = TargetReport::new("a", Termination::Ready, "ok".into(), 1, Duration::ZERO, vec![]);
        assert_eq!(ready.verdict, Verdict::Healthy);
        assert!(ready.passed());

        for termination in [
            Termination::FastFail,
            Termination::ExplicitNegative,
            Termination::TimedOut,
            Termination::Cancelled,
        ] {
            let report = TargetReport::new("a", termination, "x".into(), 1, Duration::ZERO, vec![]);
            assert_eq!(report.verdict, Verdict::Unhealthy);
        }
    }

    #[test]
    fn test_timed_out_flag() {
        let timed_out =
            TargetReport::new("a", Termination::TimedOut, "x".into(), 4, Duration::ZERO, vec![]);
        let explicit = TargetReport::new(
            "a",
            Termination::ExplicitNegative,
            "x".into(),
            4,
            Duration::ZERO,
            vec![],
        );
        assert!(timed_out.timed_out());
        assert!(!explicit.timed_out());
        assert!(!explicit.fast_failed());
    }

    #[test]
    fn test_all_healthy_and_counts() {
        let report = session(vec![
            TargetReport::new("a", Termination::Ready, "ok".into(), 1, Duration::ZERO, vec![]),
            TargetReport::new("b", Termination::TimedOut, "x".into(), 9, Duration::ZERO, vec![]),
        ]);
        assert!(!report.all_healthy());
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.get("b").is_some_and(|t| t.timed_out()));

        let empty = session(vec![]);
        assert!(empty.all_healthy());
    }

    #[test]
    fn test_text_report_lists_failure_details() {
        let report = session(vec![
            TargetReport::new(
                "empire-c2",
                Termination::Ready,
                "functional checks pass".into(),
                2,
                Duration::from_millis(4_000),
                vec![],
            ),
            TargetReport::new(
                "havoc-c2",
                Termination::TimedOut,
                "not ready after 30s: waiting on tcp 127.0.0.1:40056".into(),
                15,
                Duration::from_millis(30_000),
                vec![probe("tcp 127.0.0.1:40056", Outcome::Failure, Some("connection refused"))],
            ),
        ]);

        let text = report.render_text(false);
        assert!(text.contains("Healthy: 1"));
        assert!(text.contains("Failed:  1"));
        assert!(text.lines().any(|l| l.starts_with("empire-c2") && l.contains("PASS")));
        assert!(text.lines().any(|l| l.starts_with("havoc-c2") && l.contains("TIMEOUT")));
        assert!(text.contains("[FAIL] tcp 127.0.0.1:40056 (connection refused)"));
        assert!(!text.contains("Skipped"));
        assert!(!text.contains("empire-c2: functional checks pass"));

        let detailed = report.render_text(true);
        assert!(detailed.contains("Details:"));
        assert!(detailed.contains("empire-c2: functional checks pass"));
    }

    #[test]
    fn test_json_report_shape() {
        let mut report = session(vec![TargetReport::new(
            "sliver-c2",
            Termination::FastFail,
            "container sliver-c2 is exited".into(),
            1,
            Duration::from_millis(120),
            vec![probe("tcp 127.0.0.1:31337", Outcome::Failure, None)],
        )]);
        report.skipped.push(SkippedTarget {
            target: "mythic".into(),
            reason: "slow target skipped in short mode".into(),
        });

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["targets"][0]["verdict"], "unhealthy");
        assert_eq!(value["targets"][0]["termination"], "fast_fail");
        assert_eq!(value["targets"][0]["probes"][0]["outcome"], "failure");
        assert_eq!(value["skipped"][0]["target"], "mythic");
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = session(vec![]);
        report.write_json(&path).unwrap();

        let loaded: SessionReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.session_id, "test");
        assert!(loaded.targets.is_empty());
    }
}
