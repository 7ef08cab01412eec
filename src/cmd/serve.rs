//! Lead pipeline server command: `multitalk serve`.

use anyhow::Result;
use std::path::Path;

use multitalk::config::MultitalkToml;
use multitalk::crm::server::{ServerConfig, start_server};

pub async fn cmd_serve(project_dir: &Path, config: &MultitalkToml) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(%warning, "Configuration warning");
    }

    start_server(ServerConfig::from_toml(config, project_dir)).await
}
