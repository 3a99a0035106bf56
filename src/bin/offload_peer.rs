use std::sync::Arc;

use anyhow::Result;
use offload::config::PeerConfig;
use offload::peer::PeerServer;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let bind = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "0.0.0.0:4321".to_string());
    let apps_dir = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "offload-apps".to_string());

    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    eprintln!("offload-peer listening on {bind} (apps in {apps_dir})");
    let server = PeerServer::bind(
        &PeerConfig::new(bind, apps_dir),
        Arc::new(offload::demo::registry()),
    )?;
    server.serve()
}
