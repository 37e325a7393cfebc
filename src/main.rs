use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use opshub::agent::registry::AgentRegistry;
use opshub::agent::rpc::{self, HostMonitorService};
use opshub::config::Config;
use opshub::metrics::Metrics;
use opshub::recording::{cleanup, storage};
use opshub::store::{AppState, ConnectionGuard, Db, bootstrap, schema};
use opshub::{api, audit};

#[derive(Debug, Parser)]
#[command(name = "opshub", about = "Centralized fleet operations platform")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "OPSHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Admin password for first-run bootstrap.
    #[arg(long, env = "OPSHUB_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("OPSHUB_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "configuration load failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration invalid");
        std::process::exit(1);
    }
    let master_key = config.master_key()?;
    let config = Arc::new(config);

    let metrics = Arc::new(Metrics::new()?);

    let db = Db::connect(&config.database_url(), &config.database).await?;
    schema::migrate(&db).await?;
    bootstrap::run(
        &db,
        args.admin_password.as_deref(),
        config.security.bcrypt_cost,
    )
    .await?;

    let (audit_logger, audit_writer) =
        audit::writer::spawn(db.clone(), &config.audit, Arc::clone(&metrics));

    let registry = AgentRegistry::new(db.clone(), config.agent.clone(), Arc::clone(&metrics));

    let recording_storage = storage::from_config(&config.recording)?;

    let root_cancel = CancellationToken::new();
    let cleanup_handle = cleanup::spawn(
        db.clone(),
        Arc::clone(&recording_storage),
        config.recording.clone(),
        Arc::clone(&metrics),
        root_cancel.clone(),
    )?;

    // Best effort: pod terminals need a kubeconfig; everything else works
    // without one.
    let kube = match kube::Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::warn!(error = %e, "kubernetes client unavailable; pod terminals disabled");
            None
        }
    };

    let state = AppState {
        db: db.clone(),
        config: Arc::clone(&config),
        metrics: Arc::clone(&metrics),
        audit: audit_logger,
        registry: Arc::clone(&registry),
        storage: recording_storage,
        cleanup: cleanup_handle,
        conn_guard: Arc::new(ConnectionGuard::new(config.query.max_connections)),
        master_key,
        kube,
    };

    let http_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.http_port)
        .parse()?;
    let grpc_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.grpc_port)
        .parse()?;

    let app = api::router(state);
    let http_cancel = root_cancel.clone();
    let http = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        tracing::info!(%http_addr, "starting http server");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { http_cancel.cancelled().await })
        .await?;
        anyhow::Ok(())
    });

    let grpc_service = HostMonitorService::new(
        db,
        registry,
        Arc::clone(&metrics),
        config.agent.report_interval_seconds,
    );
    let grpc_cancel = root_cancel.clone();
    let grpc = tokio::spawn(rpc::serve(grpc_service, grpc_addr, grpc_cancel));

    shutdown_signal().await;
    tracing::info!("shutting down");
    root_cancel.cancel();

    if let Err(e) = http.await? {
        tracing::error!(error = %e, "http server error");
    }
    if let Err(e) = grpc.await? {
        tracing::error!(error = %e, "grpc server error");
    }
    audit_writer.shutdown().await;

    tracing::info!("opshub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
