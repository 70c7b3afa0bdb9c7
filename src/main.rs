//! netmig - in-place OpenShift network plugin migration and rollback.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use netmig::config::{Action, Args, BUILD_DATE, COMMIT, Config, OutputFormat, ProtocolKind, VERSION};
use netmig::error::ErrorKind;
use netmig::exec::ProcessExecutor;
use netmig::logging;
use netmig::protocol;
use netmig::report;
use netmig::sequencer::StepSequencer;
use netmig::step::Runtime;

const EXIT_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(&args.log_format, &args.log_level);

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    info!(
        version = VERSION,
        commit = COMMIT,
        build_date = BUILD_DATE,
        "netmig starting"
    );
    config.display();

    match run(&config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn run(config: &Config) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let executor = ProcessExecutor::new()
        .with_oc_path(config.oc_path.clone())
        .with_kubeconfig(config.kubeconfig.clone())
        .with_call_timeout(Some(config.call_timeout));
    let rt = Runtime::new(Arc::new(executor), cancel)
        .with_read_retry(config.read_retry)
        .with_write_retry(config.write_retry)
        .with_dry_run(config.dry_run);

    let sequence = match &config.action {
        Action::Plan(kind) => return print_plan(config, *kind),
        Action::Status(target) => return print_status(config, &rt, *target).await,
        Action::Preflight(target) => protocol::preflight(*target, &config.protocol),
        Action::Migrate => protocol::migration(&config.protocol),
        Action::Rollback => protocol::rollback(&config.protocol),
        Action::Reboot(role) => Ok(protocol::reboot(role.clone(), &config.protocol)),
    };
    let mut sequence = match sequence {
        Ok(sequence) => sequence,
        Err(e) => {
            error!(error = %e, "Failed to assemble protocol");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    };

    run_sequence(config, &rt, &mut sequence).await
}

async fn run_sequence(config: &Config, rt: &Runtime, sequence: &mut StepSequencer) -> Result<ExitCode> {
    info!(
        sequence = sequence.name(),
        steps = sequence.stages().len(),
        from = ?config.selection.from,
        skip = ?config.selection.skip,
        "Running sequence"
    );

    let outcome = sequence.run(rt, &config.selection).await;

    let rendered = match config.output {
        OutputFormat::Json => report::render_json(&outcome).context("Failed to serialize report")?,
        OutputFormat::Table => match &outcome {
            Ok(report) => report::render_success_table(report),
            Err(failure) => report::render_failure_table(failure),
        },
    };
    println!("{rendered}");

    Ok(match outcome {
        Ok(report) => {
            info!(
                sequence = %report.sequence,
                elapsed_secs = report.elapsed.as_secs(),
                "Sequence completed"
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!(
                step = %failure.step,
                kind = %failure.kind,
                attempts = failure.attempts,
                "Sequence stopped"
            );
            if failure.kind == ErrorKind::InvalidSpec {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::from(EXIT_FAILED)
            }
        }
    })
}

fn print_plan(config: &Config, kind: ProtocolKind) -> Result<ExitCode> {
    let sequence = match kind {
        ProtocolKind::Migrate => protocol::migration(&config.protocol),
        ProtocolKind::Rollback => protocol::rollback(&config.protocol),
    }
    .context("Failed to assemble protocol")?;

    let entries = report::plan(&sequence);
    match config.output {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("Failed to serialize plan")?
        ),
        OutputFormat::Table => println!("{}", report::plan_table(&entries)),
    }
    Ok(ExitCode::SUCCESS)
}

async fn print_status(config: &Config, rt: &Runtime, target: netmig::cluster::NetworkType) -> Result<ExitCode> {
    let mut checks = protocol::status_checks(target);
    let records = protocol::observe(&mut checks, &rt.probe()).await;

    match config.output {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&records).context("Failed to serialize status")?
        ),
        OutputFormat::Table => println!("{}", report::checks_table(&records)),
    }
    Ok(ExitCode::SUCCESS)
}

/// Cancels `token` on SIGINT or SIGTERM. In-flight steps stop at their next
/// suspension point.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("Received shutdown signal, cancelling current step");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "Failed to listen for SIGTERM");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
