//! fc-agent entry point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use fc_agent::config::{Config, LogConfig};
use fc_agent::events::EventBus;
use fc_agent::grpc::pb::firecracker_agent_server::FirecrackerAgentServer;
use fc_agent::grpc::server::AgentService;
use fc_agent::vm::Manager;

/// How long to wait for in-flight calls after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// fc-agent - gRPC service for managing Firecracker microVMs
#[derive(Parser, Debug)]
#[command(name = "fc-agent")]
#[command(about = "gRPC service for managing Firecracker microVMs")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "configs/agent.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let cfg = Arc::new(Config::load(&cli.config)?);
    init_logging(&cfg.log);

    tracing::info!(
        version = fc_agent::VERSION,
        config = %cli.config,
        "starting Firecracker agent"
    );

    let events = Arc::new(EventBus::new());
    let manager = Arc::new(Manager::new(cfg.clone(), events.clone()));
    manager.init_host().await?;

    if cfg.monitoring.enabled {
        let port = cfg.monitoring.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = fc_agent::metrics::serve(port).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        });
    }

    let service = AgentService::new(manager, events, start_time);

    let addr: std::net::SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    tracing::info!(address = %addr, "gRPC server listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server_task = tokio::spawn(
        Server::builder()
            .add_service(FirecrackerAgentServer::new(service))
            .serve_with_shutdown(addr, async {
                let _ = shutdown_rx.await;
            }),
    );

    tokio::select! {
        result = &mut server_task => {
            result??;
            return Err("server exited unexpectedly".into());
        }
        _ = shutdown_signal() => {
            tracing::info!("received shutdown signal, shutting down gracefully");
        }
    }

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, server_task).await {
        Ok(result) => {
            result??;
            tracing::info!("server stopped gracefully");
        }
        Err(_) => {
            tracing::warn!("shutdown timeout, forcing stop");
        }
    }

    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = async {
            match sigterm.as_mut() {
                Some(term) => { term.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => {}
    }
}

fn init_logging(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.clone()));

    if log.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
