mod cli;
mod collector;
mod config;
mod ecs;
mod error;
mod logs;
mod model;
mod output;
mod session;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use cli::{CliArgs, Command, ConfigCommand, DeleteCommand, DescribeCommand, GetCommand};
use collector::{collect_all, describe_named};
use config::ContextStore;
use ecs::{ControlPlane, EcsGateway, cancellable};
use error::EcsError;
use logs::{LogRequest, TokioPacer, open_log_stream};
use model::{DescribedResource, ResourceKind, Target};
use output::OutputFormat;
use session::{BridgeNotice, BridgeOutcome, BridgeRequest, PortMapping, RelayConfig, SessionBridge};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const STOP_REASON: &str = "Stopped via ecs CLI";

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());
    run(args, &cancel).await
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("warn"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run(args: CliArgs, cancel: &CancellationToken) -> Result<()> {
    let store = ContextStore::discover(args.config.clone())?;
    debug!(registry = %store.path().display(), "using context registry");

    match args.command {
        Command::Version => {
            println!("ecs version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Config(command) => run_config(&store, command),
        command => {
            let target = store
                .active()
                .context("failed to get current context")?;
            let gateway = Arc::new(EcsGateway::connect(&target).await);
            let relay = RelayConfig::from_override(args.relay);
            run_remote(command, gateway, relay, cancel).await
        }
    }
}

fn run_config(store: &ContextStore, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::SetContext {
            name,
            cluster,
            profile,
            region,
        } => {
            let target = Target {
                name: name.clone(),
                cluster,
                profile,
                region,
            };
            store
                .set_target(target.clone())
                .with_context(|| format!("failed to save context {name}"))?;
            println!("Context '{name}' created and set as current context");
            print_target(&target);
        }
        ConfigCommand::GetContexts => {
            let (targets, active) = store.list_all().context("failed to list contexts")?;
            print!("{}", output::render_contexts(&targets, &active));
        }
        ConfigCommand::UseContext { name } => {
            store.use_target(&name)?;
            println!("Switched to context {name:?}");
        }
        ConfigCommand::DeleteContext { name } => {
            store.delete(&name)?;
            println!("Context {name:?} deleted");
        }
        ConfigCommand::CurrentContext => {
            let target = store.active()?;
            println!("Current context: {}", target.name);
            print_target(&target);
        }
        ConfigCommand::View => {
            let registry = store.load().context("failed to read configuration")?;
            print!("{}", registry.view());
        }
    }
    Ok(())
}

fn print_target(target: &Target) {
    println!("Cluster: {}", target.cluster);
    println!("Profile: {}", target.profile);
    println!("Region: {}", target.region);
}

async fn run_remote(
    command: Command,
    gateway: Arc<EcsGateway>,
    relay: RelayConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Command::Get(get) => {
            let (kind, format) = match get {
                GetCommand::Services { output } => (ResourceKind::Services, output),
                GetCommand::Tasks { output } => (ResourceKind::Tasks, output),
                GetCommand::Nodes { output } => (ResourceKind::Nodes, output),
            };
            let records = collect_all(gateway.as_ref(), kind, cancel)
                .await
                .with_context(|| format!("failed to list {}", kind.title().to_lowercase()))?;
            print!(
                "{}",
                output::render_resources(kind, &records, format, Utc::now())?
            );
        }
        Command::Describe(DescribeCommand::Services { names, output }) => {
            let records = if names.is_empty() {
                collect_all(gateway.as_ref(), ResourceKind::Services, cancel).await
            } else {
                describe_named(gateway.as_ref(), ResourceKind::Services, &names, cancel).await
            }
            .context("failed to describe services")?;
            for name in &names {
                if !records.iter().any(|record| record.name() == name.as_str()) {
                    warn!("service {name} not found");
                }
            }
            print_described(&records, output)?;
        }
        Command::Describe(DescribeCommand::Task { task, output }) => {
            let records = describe_named(
                gateway.as_ref(),
                ResourceKind::Tasks,
                std::slice::from_ref(&task),
                cancel,
            )
            .await
            .with_context(|| format!("failed to describe task {task}"))?;
            if records.is_empty() {
                return Err(EcsError::not_found("task", task).into());
            }
            print_described(&records, output)?;
        }
        Command::Scale { service, replicas } => {
            cancellable(
                cancel,
                "scale service",
                gateway.update_desired_count(&service, replicas),
            )
            .await
            .with_context(|| format!("failed to scale service {service}"))?;
            println!("Successfully scaled service {service} to {replicas} replicas");
        }
        Command::Delete(DeleteCommand::Task { task }) => {
            cancellable(cancel, "stop task", gateway.stop_task(&task, STOP_REASON))
                .await
                .with_context(|| format!("failed to stop task {task}"))?;
            println!("Task {task} stopped successfully");
        }
        Command::Logs {
            task,
            follow,
            since,
            container,
        } => {
            let request = LogRequest {
                task: task.clone(),
                container: container.name,
                since: since.unwrap_or(logs::DEFAULT_SINCE),
                follow,
            };
            stream_logs(gateway, &request, cancel)
                .await
                .with_context(|| format!("failed to get logs for task {task}"))?;
        }
        Command::Exec {
            task,
            container,
            command,
        } => {
            let request = BridgeRequest::Exec {
                command: command.join(" "),
            };
            bridge(&gateway, relay, &task, container.name.as_deref(), request, cancel)
                .await
                .with_context(|| format!("failed to execute command in task {task}"))?;
        }
        Command::PortForward {
            task,
            mapping,
            container,
        } => {
            let mapping = mapping.parse::<PortMapping>()?;
            println!(
                "Forwarding local port {} to container port {} in task {task}...",
                mapping.local, mapping.container
            );
            let request = BridgeRequest::PortForward(mapping);
            bridge(&gateway, relay, &task, container.name.as_deref(), request, cancel)
                .await
                .with_context(|| format!("failed to forward port to task {task}"))?;
        }
        Command::Config(_) | Command::Version => {}
    }
    Ok(())
}

fn print_described(records: &[DescribedResource], format: OutputFormat) -> Result<()> {
    print!("{}", output::render_described(records, format)?);
    Ok(())
}

async fn stream_logs(
    gateway: Arc<EcsGateway>,
    request: &LogRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut stream = open_log_stream(gateway, TokioPacer, request, cancel).await?;
    debug!(
        group = %stream.destination().group,
        stream = %stream.destination().stream,
        "streaming logs"
    );

    let mut stdout = std::io::stdout();
    while let Some(item) = stream.next_record().await {
        let record = item?;
        if writeln!(stdout, "{}", output::log_line(&record)).is_err() {
            break;
        }
    }
    Ok(())
}

async fn bridge(
    gateway: &EcsGateway,
    relay: RelayConfig,
    task: &str,
    container: Option<&str>,
    request: BridgeRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut bridge = SessionBridge::new(gateway, relay, gateway.region());
    let outcome = bridge
        .run(task, container, request, cancel, &mut report_notice)
        .await?;
    debug!(state = ?bridge.state(), ?outcome, "session bridge finished");
    if outcome == BridgeOutcome::Interrupted {
        eprintln!("\nSession stopped.");
    }
    Ok(())
}

fn report_notice(notice: BridgeNotice) {
    match notice {
        BridgeNotice::ContainerDetected(name) => println!("Auto-detected container: {name}"),
        BridgeNotice::SessionStarting { task, container } => {
            println!("Starting session with task {task} (container {container})...");
        }
        BridgeNotice::Forwarding(mapping) => {
            println!(
                "Forwarding from 127.0.0.1:{} -> {}",
                mapping.local, mapping.container
            );
            println!(
                "Forwarding from [::1]:{} -> {}",
                mapping.local, mapping.container
            );
            println!("Press Ctrl+C to stop port forwarding");
        }
    }
}
