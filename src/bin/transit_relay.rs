use std::io;
use std::sync::Arc;

use clap::Parser;
use log::debug;
use tokio::net::TcpListener;

use wormhole_relay::config::TransitConfig;
use wormhole_relay::store::SqliteStore;
use wormhole_relay::transit::{self, TransitState};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let config = TransitConfig::parse();

    let store = SqliteStore::connect(&config.db_url)
        .await
        .expect("failed to open store");

    let listener = TcpListener::bind(config.listen.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.listen));
    debug!("transit relay listening on {}", config.listen);

    transit::run(listener, Arc::new(TransitState::new()), Arc::new(store)).await;

    Ok(())
}
