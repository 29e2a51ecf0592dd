use pagesync_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting pagesync relay on {} (max {} peers per room)",
        config.bind_addr,
        config.max_peers_per_room
    );

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
