//! Readycheck engine - readiness verification for deployed container services.
//!
//! A [`Session`] polls every selected [`Target`] concurrently. Each poll
//! loop runs the target's probes in declared order, reconciles their
//! results into a [`Verdict`], and stops on Healthy, on a container in a
//! terminal state, or at its deadline.

pub mod aggregate;
pub mod poll;
pub mod probe;
pub mod provisioner;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod session;
pub mod target;

pub use aggregate::{aggregate, Assessment, Verdict};
pub use poll::poll_target;
pub use probe::{run_probe, Outcome, ProbeContext, ProbeResult};
pub use provisioner::{preflight, PreflightReport, Provisioner, TerraformCli};
pub use registry::{PollOverride, Selection, TargetRegistry};
pub use report::{SessionReport, SkippedTarget, TargetReport, Termination};
pub use runtime::{ContainerRuntime, DockerCli};
pub use session::Session;
pub use target::{HealthPolicy, ProbeDecl, ProbeKind, ProbeSpec, Target};
