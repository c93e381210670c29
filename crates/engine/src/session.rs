//! Verification session: polls every selected target concurrently.

use crate::poll::poll_target;
use crate::probe::ProbeContext;
use crate::registry::Selection;
use crate::report::{SessionReport, Termination, TargetReport};
use crate::target::Target;
use readycheck_common::Timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs poll loops for a set of targets and collects their reports.
pub struct Session {
    ctx: ProbeContext,
}

impl Session {
    pub fn new(ctx: ProbeContext) -> Self {
        Self { ctx }
    }

    /// Verify every selected target. Completes once all targets are terminal.
    pub async fn run(&self, selection: Selection, cancel: CancellationToken) -> SessionReport {
        let session_id = uuid::Uuid::new_v4().to_string();
        let started_at = Timestamp::now();
        let started = Instant::now();
        let expected = selection.targets.len();

        info!(
            session_id = %session_id,
            targets = expected,
            skipped = selection.skipped.len(),
            "Starting verification session"
        );

        let (tx, mut rx) = mpsc::channel::<TargetReport>(expected.max(1));
        let mut handles = Vec::with_capacity(expected);
        for target in &selection.targets {
            let ctx = self.ctx.clone();
            let target = Arc::clone(target);
            let cancel = cancel.clone();
            let tx = tx.clone();
            handles.push((
                target.name.clone(),
                tokio::spawn(async move {
                    let report = poll_target(&ctx, &target, &cancel).await;
                    let _ = tx.send(report).await;
                }),
            ));
        }
        drop(tx);

        let mut targets = Vec::with_capacity(expected);
        while let Some(report) = rx.recv().await {
            targets.push(report);
        }

        // A task that panicked never sent its report.
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!(target_name = %name, "Poll task failed: {}", e);
                if !targets.iter().any(|r| r.target == name) {
                    targets.push(TargetReport::new(
                        &name,
                        Termination::TimedOut,
                        format!("poll task failed: {}", e),
                        0,
                        Duration::ZERO,
                        Vec::new(),
                    ));
                }
            }
        }

        let report = SessionReport {
            session_id,
            started_at,
            finished_at: Timestamp::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            targets,
            skipped: selection.skipped,
        };
        info!(
            session_id = %report.session_id,
            healthy = report.passed(),
            failed = report.failed(),
            elapsed_ms = report.elapsed_ms,
            "Verification session complete"
        );
        report
    }

    /// Convenience for callers holding plain targets.
    pub async fn run_targets(&self, targets: Vec<Target>, cancel: CancellationToken) -> SessionReport {
        let selection = Selection {
            targets: targets.into_iter().map(Arc::new).collect(),
            skipped: Vec::new(),
        };
        self.run(selection, cancel).await
    }
}
