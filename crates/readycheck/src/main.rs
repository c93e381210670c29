//! Readycheck - verify that deployed container services are ready.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use readycheck_engine::{
    preflight, DockerCli, PollOverride, ProbeContext, Provisioner, Session, TargetRegistry,
    TerraformCli,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "readycheck")]
#[command(
    author,
    version,
    about = "Verify that deployed container services reached a working state"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll targets until each is healthy, broken, or out of time
    Verify {
        /// Registry file (YAML or JSON); the built-in registry when omitted
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Target to verify (repeatable); all targets when omitted
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Skip slow multi-minute deployment checks
        #[arg(long)]
        short: bool,

        /// Deadline override: SECS for every target, or NAME=SECS
        #[arg(long)]
        deadline: Vec<PollOverride>,

        /// Inter-attempt delay override: SECS for every target, or NAME=SECS
        #[arg(long)]
        delay: Vec<PollOverride>,

        /// Terraform directory whose outputs fill ${name} endpoint placeholders
        #[arg(long)]
        terraform_dir: Option<PathBuf>,

        /// Report format
        #[arg(long, value_enum, default_value = "text")]
        format: Format,

        /// Also write the JSON report to this file
        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// List registered targets and their probes
    List {
        #[arg(long)]
        registry: Option<PathBuf>,
    },

    /// Validate a registry without polling
    Check {
        #[arg(long)]
        registry: Option<PathBuf>,
    },

    /// Validate and plan the infrastructure, and check registry endpoints
    Preflight {
        #[arg(long)]
        terraform_dir: PathBuf,

        #[arg(long)]
        registry: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    let (text, json) = match cli.log_format {
        Format::Text => (
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
            None,
        ),
        Format::Json => (None, Some(fmt::layer().json().with_writer(std::io::stderr))),
    };
    tracing_subscriber::registry()
        .with(text)
        .with(json)
        .with(filter)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let configuration = e
                .downcast_ref::<readycheck_common::Error>()
                .is_some_and(readycheck_common::Error::is_configuration);
            if configuration {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Verify {
            registry,
            targets,
            short,
            deadline,
            delay,
            terraform_dir,
            format,
            out,
        } => {
            let mut registry = load_registry(registry.as_deref())?;

            if let Some(dir) = terraform_dir {
                let terraform = TerraformCli::locate(&dir)?;
                let outputs = terraform
                    .outputs()
                    .await
                    .context("Failed to read terraform outputs")?;
                info!("Loaded {} terraform outputs from {:?}", outputs.len(), dir);
                registry.resolve_endpoints(&outputs);
            }
            registry.apply_overrides(&deadline, &delay)?;
            registry.validate()?;
            let selection = registry.select(&targets, short)?;
            for skipped in &selection.skipped {
                info!("Skipping {}: {}", skipped.target, skipped.reason);
            }

            let runtime = DockerCli::locate()?;
            let ctx = ProbeContext::new(Arc::new(runtime))?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, abandoning remaining targets");
                    on_interrupt.cancel();
                }
            });

            let report = Session::new(ctx).run(selection, cancel).await;

            match format {
                Format::Text => print!("{}", report.render_text(cli.verbose)),
                Format::Json => println!("{}", report.to_json()?),
            }
            if let Some(path) = out {
                report
                    .write_json(&path)
                    .with_context(|| format!("Failed to write report to {:?}", path))?;
                info!("Report written to {:?}", path);
            }

            Ok(if report.all_healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::List { registry } => {
            let registry = load_registry(registry.as_deref())?;
            for target in registry.targets() {
                let slow = if target.slow { " [slow]" } else { "" };
                println!(
                    "{}{} (deadline {}s, delay {}s)",
                    target.name, slow, target.poll.deadline_secs, target.poll.delay_secs
                );
                if let Some(description) = &target.description {
                    println!("  {}", description);
                }
                for probe in &target.probes {
                    println!("  - {:<18} {}", probe.kind().to_string(), probe.label(target));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Check { registry } => {
            let registry = load_registry(registry.as_deref())?;
            registry.validate()?;
            println!("{} target(s) valid", registry.len());
            let placeholders = registry.placeholders();
            if !placeholders.is_empty() {
                let names: Vec<String> = placeholders.into_iter().collect();
                println!("Endpoints need provisioner outputs: {}", names.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Preflight {
            terraform_dir,
            registry,
        } => {
            let registry = load_registry(registry.as_deref())?;
            let terraform = TerraformCli::locate(&terraform_dir)?;
            let report = preflight(&terraform, &registry).await?;

            if let Some(plan) = &report.plan {
                if plan.changes_pending {
                    println!("Plan: infrastructure changes pending");
                } else {
                    println!("Plan: no changes");
                }
            }
            println!("Outputs: {}", report.outputs.len());
            for name in &report.missing_outputs {
                println!("  missing output: {}", name);
            }
            for name in &report.empty_outputs {
                println!("  empty output: {}", name);
            }

            Ok(if report.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn load_registry(path: Option<&Path>) -> anyhow::Result<TargetRegistry> {
    let registry = match path {
        Some(path) => {
            info!("Loading registry from {:?}", path);
            TargetRegistry::load(path)?
        }
        None => TargetRegistry::builtin()?,
    };
    Ok(registry)
}
