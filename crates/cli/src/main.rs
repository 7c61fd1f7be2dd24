use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use webmux_cli::cli::Cli;
use webmux_cli::logging;
use webmux_cli::reload::{MtimeChangeDetector, NoopSideChannel, ProcessHooks};
use webmux_cli::server::{self, ServerContext, ToolDispatcher, UnavailableDispatcher};
use webmux_core::bridge::{BridgeConfig, Role, SecondaryBridge, elect_role};
use webmux_core::lock::{LockRegistry, default_lock_path, new_record};
use webmux_core::probe::ProbeClient;
use webmux_core::serializer::{Serializer, StalenessConfig};
use webmux_protocol::LockRecord;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("webmux: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let lock_path = cli.lock_path.clone().unwrap_or_else(default_lock_path);
    let registry = LockRegistry::new(lock_path);
    let probe = ProbeClient::new();

    let role = if cli.force_primary {
        Role::Primary
    } else {
        elect_role(&registry, &probe).await
    };

    match role {
        Role::Primary => run_primary(cli, registry).await,
        Role::Secondary(record) => run_secondary(registry, probe, record).await,
    }
}

async fn run_primary(cli: Cli, registry: LockRegistry) -> Result<()> {
    let (listener, port) = server::bind(cli.port).await?;
    let record = new_record(port);
    registry
        .write(&record)
        .context("failed to write lock record")?;
    info!(
        target = "webmux",
        port,
        instance = %record.instance_id,
        "running as Primary"
    );

    let hooks = Arc::new(ProcessHooks::new(
        LockRegistry::new(registry.path().to_path_buf()),
        record.instance_id.clone(),
    ));
    let serializer = Arc::new(Serializer::new(staleness_config(&cli), hooks));
    let dispatcher: Arc<dyn ToolDispatcher> = Arc::new(UnavailableDispatcher);

    let context = ServerContext {
        serializer: Arc::clone(&serializer),
        dispatcher: Arc::clone(&dispatcher),
        instance_id: record.instance_id.clone(),
    };
    let endpoint = tokio::spawn(server::serve(listener, context));

    // Stdio and websocket ingress share the serializer, so calls from every
    // client interleave into one global FIFO.
    let pumped = pump_stdio(serializer, dispatcher).await;
    endpoint.abort();
    registry
        .remove_if(&record.instance_id)
        .context("failed to remove lock record")?;
    info!(target = "webmux", "Primary shut down cleanly");
    pumped
}

async fn run_secondary(
    registry: LockRegistry,
    probe: ProbeClient,
    record: LockRecord,
) -> Result<()> {
    info!(
        target = "webmux",
        port = record.port,
        "running as Secondary, relaying to Primary"
    );
    let bridge = SecondaryBridge::new(registry, probe, BridgeConfig::default());
    bridge
        .run(record, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("relay to Primary failed")?;
    info!(target = "webmux", "Secondary shut down cleanly");
    Ok(())
}

fn staleness_config(cli: &Cli) -> Option<StalenessConfig> {
    if cli.no_staleness_check {
        return None;
    }
    let (server_root, companion_root) = match (&cli.server_root, &cli.companion_root) {
        (Some(server), Some(companion)) => (server.clone(), companion.clone()),
        _ => return None,
    };
    Some(StalenessConfig {
        server_root,
        companion_root,
        detector: Arc::new(MtimeChangeDetector::new()),
        side_channel: Arc::new(NoopSideChannel),
    })
}

async fn pump_stdio(
    serializer: Arc<Serializer>,
    dispatcher: Arc<dyn ToolDispatcher>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(reply) = server::execute_line(&serializer, dispatcher.as_ref(), &line).await
        else {
            continue;
        };
        stdout.write_all(reply.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}
