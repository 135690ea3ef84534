//! Engine server command: `devroom serve`.

use anyhow::Result;
use std::path::Path;

use super::config::load_effective;

pub async fn cmd_serve(
    config_path: &Path,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    let mut config = load_effective(config_path)?;

    // CLI flags sit on top of file and environment
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if dev {
        config.server.dev_mode = true;
    }

    devroom::session::server::start_server(config).await
}
