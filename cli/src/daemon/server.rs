// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent HTTP server implementation

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use hearth_core::{
    application::{
        console::ConsoleService,
        files::FileService,
        lifecycle::{LifecycleSettings, StandardLifecycleService},
        repository_factory::{create_blueprint_repository, create_server_repository, open_database},
        telemetry::TelemetryService,
        terminal::TerminalSessions,
    },
    domain::{
        access::AccessGuard, engine::ContainerEngine, node_config::NodeConfigManifest,
        repository::StorageBackend,
    },
    infrastructure::{access::RegistryAccessGuard, docker::DockerEngine},
    presentation::api::{self, AppState},
};

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    let spec = &config.spec;
    info!(node_id = %spec.node.id, "Hearth agent starting (PID: {})", std::process::id());

    if let Some(port) = spec.observability.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to start metrics exporter")?;
        info!("Metrics exporter listening on :{}", port);
    }

    let docker = DockerEngine::connect(spec.docker.socket_path.as_deref())
        .context("Failed to connect to container engine")?;
    docker
        .healthcheck()
        .await
        .context("Container engine is not reachable")?;
    let engine: Arc<dyn ContainerEngine> = Arc::new(docker);

    let backend = StorageBackend::from_url(&spec.database.url);
    if backend == StorageBackend::InMemory {
        warn!("database.url is 'memory'; server state will not survive a restart");
    }
    let database = open_database(&backend)
        .await
        .context("Failed to open database")?;
    let servers = create_server_repository(&backend, database.as_ref())?;
    let blueprints = create_blueprint_repository(&backend, database.as_ref())?;

    let guard: Arc<dyn AccessGuard> = Arc::new(RegistryAccessGuard::new(servers.clone()));
    let terminals = Arc::new(TerminalSessions::new(engine.clone()));

    let lifecycle = Arc::new(StandardLifecycleService::new(
        servers.clone(),
        blueprints.clone(),
        engine.clone(),
        guard.clone(),
        terminals.clone(),
        LifecycleSettings::from_config(spec),
    ));
    let resumed = lifecycle
        .resume_pending_installs()
        .await
        .context("Failed to resume interrupted installs")?;
    if resumed > 0 {
        info!("Resumed {} interrupted install(s)", resumed);
    }

    let console = Arc::new(ConsoleService::new(
        engine.clone(),
        servers.clone(),
        guard.clone(),
        terminals,
        spec.console.log_tail_lines,
    ));
    let telemetry = Arc::new(TelemetryService::new(
        engine.clone(),
        servers.clone(),
        guard.clone(),
        spec.telemetry.storage_sample_interval,
    ));
    let files = Arc::new(FileService::new(engine, servers, blueprints, guard));

    match (&spec.api.backend_token, spec.api.insecure_open_access) {
        (Some(_), _) => {}
        (None, true) => {
            warn!("api.backend_token is not set and api.insecure_open_access is on; requests are not authenticated")
        }
        (None, false) => {
            error!("api.backend_token is not set; every API request will be refused")
        }
    }

    let app = api::app(AppState {
        node_id: spec.node.id.clone(),
        lifecycle,
        console,
        telemetry,
        files,
        backend_token: spec.api.backend_token.clone(),
        insecure_open_access: spec.api.insecure_open_access,
        start_time: Instant::now(),
    });

    let addr = format!("{}:{}", spec.api.bind_address, spec.api.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Agent listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Agent shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
