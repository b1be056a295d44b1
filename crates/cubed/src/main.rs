//! cubed — Cube dispatcher gateway daemon.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cube_core::config::DispatcherConfig;
use cube_dispatch::telemetry::{JsonLinesSink, NullSink};
use cube_dispatch::{
    DirectorRegistry, Endpoint, LogBuffer, LogCapture, Performer, Presence, Reaper,
    ReaperSettings, ReportSink, Scope, SessionId, SessionRef,
};

mod cellet;
mod transport;

use cellet::{Clients, PassThroughCellet};

type CelletTable = Arc<HashMap<String, Arc<PassThroughCellet>>>;

/// How long shutdown waits for the reaper's last sweep.
const REAPER_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let logs = LogBuffer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(LogCapture::new(logs.clone()))
        .init();

    // Load config
    if let Err(e) = DispatcherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DispatcherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DispatcherConfig::default()
    });
    tracing::info!(node = %config.node.name, "cubed starting");

    // Directors
    let registry = build_registry(&config);
    if registry.is_empty() {
        tracing::warn!("no directors configured, every relay will fail");
    }

    let presence = Presence::new();
    let performer = Arc::new(Performer::new(
        registry,
        presence.clone(),
        config.performer.block_timeout(),
    ));

    // One pass-through cellet per advertised service
    let clients = Clients::default();
    let cellets: CelletTable = {
        let mut table = HashMap::new();
        for director in performer.registry().directors() {
            for name in &director.scope.cellets {
                table.entry(name.clone()).or_insert_with(|| {
                    Arc::new(PassThroughCellet::new(
                        name.clone(),
                        clients.clone(),
                        presence.clone(),
                    ))
                });
            }
        }
        for cellet in table.values() {
            performer.add_cellet(cellet.clone());
        }
        tracing::info!(cellets = table.len(), "cellets registered");
        Arc::new(table)
    };

    let connected = {
        let p = performer.clone();
        performer
            .start(move |endpoint| transport::connect_director(endpoint, p.clone()))
            .await
    };
    if connected == 0 && !performer.registry().is_empty() {
        tracing::error!("no director reachable at startup");
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let sink: Arc<dyn ReportSink> = match &config.telemetry.report_path {
        Some(path) => match JsonLinesSink::open(path) {
            Ok(sink) => {
                tracing::info!(path = %path.display(), "writing reports");
                Arc::new(sink)
            }
            Err(e) => {
                tracing::warn!(error = %e, "report file unavailable, discarding reports");
                Arc::new(NullSink)
            }
        },
        None => Arc::new(NullSink),
    };

    let mut reaper_task = tokio::spawn(
        Arc::new(Reaper::new(
            performer.clone(),
            ReaperSettings::from_config(config.node.name.clone(), &config.daemon),
            sink,
            logs,
        ))
        .run(shutdown_tx.subscribe()),
    );

    let listener = TcpListener::bind(("0.0.0.0", config.network.listen_port))
        .await
        .with_context(|| format!("failed to bind client port {}", config.network.listen_port))?;
    tracing::info!(port = config.network.listen_port, "accepting clients");

    let listener_task = tokio::spawn(accept_loop(
        listener,
        performer.clone(),
        cellets,
        clients,
        shutdown_tx.subscribe(),
    ));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = &mut reaper_task   => tracing::error!("reaper exited: {:?}", r),
        r = listener_task      => tracing::error!("client listener exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    if !drain_task(&mut reaper_task, REAPER_GRACE).await {
        tracing::warn!("reaper did not stop in time, aborted");
    }
    performer.stop();
    Ok(())
}

/// Wait up to `grace` for `task` to finish, aborting it otherwise. True
/// if it finished on its own.
async fn drain_task(task: &mut JoinHandle<()>, grace: Duration) -> bool {
    if task.is_finished() {
        return true;
    }
    match tokio::time::timeout(grace, &mut *task).await {
        Ok(_) => true,
        Err(_) => {
            task.abort();
            false
        }
    }
}

fn build_registry(config: &DispatcherConfig) -> DirectorRegistry {
    let mut registry = DirectorRegistry::new();
    for entry in &config.directors {
        let names = match entry.cellet_names() {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "skipping director");
                continue;
            }
        };
        let endpoint = Endpoint::new(entry.address.clone(), entry.port);
        if let Err(e) = registry.register(endpoint, Scope::new(entry.weight, names)) {
            tracing::warn!(error = %e, "skipping director");
        }
    }
    registry
}

async fn accept_loop(
    listener: TcpListener,
    performer: Arc<Performer>,
    cellets: CelletTable,
    clients: Clients,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("client listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let id = SessionId(next_id.fetch_add(1, Ordering::Relaxed));
                tokio::spawn(serve_client(
                    stream,
                    id,
                    performer.clone(),
                    cellets.clone(),
                    clients.clone(),
                ));
            }
        }
    }
}

/// Frame loop for one client. The session is invalidated, not forgotten,
/// when the socket closes: presence and affinity are left to the reaper.
async fn serve_client(
    stream: TcpStream,
    id: SessionId,
    performer: Arc<Performer>,
    cellets: CelletTable,
    clients: Clients,
) {
    let (client, read) = transport::accept_client(stream, id);
    clients.insert(client.clone());
    tracing::info!(session = %id, peer = client.peer(), clients = clients.len(), "client connected");

    let session: SessionRef = client.clone();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session = %id, error = %e, "client read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match transport::decode(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "dropping client frame");
                continue;
            }
        };
        match cellets.get(&frame.cellet) {
            Some(cellet) => cellet.relay(&performer, &session, frame.envelope),
            None => tracing::warn!(session = %id, cellet = %frame.cellet, "unknown cellet"),
        }
    }

    client.invalidate();
    clients.remove(id);
    tracing::info!(session = %id, "client disconnected");
}
