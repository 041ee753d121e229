//! HTTP/WebSocket server: `runway serve`.

use std::path::PathBuf;

use anyhow::Result;
use runway::config::RunwayConfig;

/// Flag overrides layered on top of file and environment settings.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub projects_root: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(mut config: RunwayConfig, overrides: ServeOverrides) -> Result<()> {
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(db_path) = overrides.db_path {
        config.server.db_path = db_path;
    }
    if let Some(root) = overrides.projects_root {
        config.projects.root = root;
    }
    if overrides.dev {
        config.server.dev_mode = true;
    }
    config.validate()?;

    runway::server::start_server(config).await
}
