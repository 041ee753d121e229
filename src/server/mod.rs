//! HTTP and WebSocket surface over the runtime services.
//!
//! Services are constructed once in [`AppState::new`] and injected into
//! handlers through axum state; nothing here is global.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RunwayConfig;
use crate::runtime::{
    CommandExecutor, CommandPolicy, ContainerRuntime, DockerRuntime, LifecycleManager,
    ProcessSupervisor, ProjectResolver, RuntimeStore, TerminalManager, reconcile,
};

pub struct AppState {
    pub lifecycle: LifecycleManager,
    pub executor: CommandExecutor,
    pub processes: ProcessSupervisor,
    pub terminals: TerminalManager,
    pub policy: Arc<CommandPolicy>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: &RunwayConfig,
        store: RuntimeStore,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let policy = Arc::new(
            CommandPolicy::from_config(&config.policy).context("Invalid command policy")?,
        );
        let workdir = config.container.workdir.clone();

        Ok(Self {
            lifecycle: LifecycleManager::new(
                store.clone(),
                runtime.clone(),
                ProjectResolver::new(config.projects.root.clone()),
                config.container.clone(),
            ),
            executor: CommandExecutor::new(
                store,
                runtime.clone(),
                policy.clone(),
                workdir.clone(),
                config.exec.clone(),
            ),
            processes: ProcessSupervisor::new(
                runtime.clone(),
                workdir.clone(),
                config.output.process_buffer_lines,
            ),
            terminals: TerminalManager::new(
                runtime,
                config.container.shell.clone(),
                workdir,
                config.output.terminal_buffer_chunks,
            ),
            policy,
        })
    }

    /// Close every terminal and stop every managed process.
    pub async fn shutdown(&self) {
        self.terminals.close_all().await;
        self.processes.stop_all().await;
    }
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/projects/{project}/runtime/ws/logs", get(ws::logs_handler))
        .route(
            "/projects/{project}/runtime/ws/terminal",
            get(ws::terminal_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the store, reconcile, and serve until Ctrl+C.
pub async fn start_server(config: RunwayConfig) -> Result<()> {
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let store = RuntimeStore::open(&config.server.db_path)
        .context("Failed to initialize runtime database")?;
    let runtime = Arc::new(
        DockerRuntime::connect(&config.container, &config.exec)
            .context("Failed to connect to Docker")?,
    );
    let state = Arc::new(AppState::new(&config, store, runtime)?);

    reconcile(&state.lifecycle).await;

    let mut app = build_router(state.clone());
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "Runway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.shutdown().await;
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
