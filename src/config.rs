//! CLI/env configuration surface for both binaries.

use clap::Parser;

/// Configuration for the `rendezvous-server` binary.
#[derive(Debug, Parser)]
#[command(name = "rendezvous-server", about = "Magic Wormhole rendezvous server")]
pub struct RendezvousConfig {
    /// `sqlx` SQLite connection string, e.g. `sqlite::memory:` or a file path.
    #[arg(long, env = "WORMHOLE_DB_URL", default_value = "sqlite::memory:")]
    pub db_url: String,

    /// Address to bind the WebSocket listener on.
    #[arg(long, env = "WORMHOLE_RENDEZVOUS_LISTEN", default_value = "127.0.0.1:4000")]
    pub listen: String,

    /// Round usage-record `started` timestamps down to this many seconds, if set.
    #[arg(long, env = "WORMHOLE_BLUR_USAGE")]
    pub blur_usage: Option<f64>,

    /// Seconds of inactivity after which a nameplate/mailbox is pruned.
    #[arg(long, env = "WORMHOLE_CHANNEL_EXPIRATION", default_value_t = 11.0 * 3600.0)]
    pub channel_expiration: f64,

    /// Server version string advertised in the `welcome` frame.
    #[arg(long, env = "WORMHOLE_ADVERTISE_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub advertise_version: String,

    /// Seconds between pruning sweeps.
    #[arg(long, env = "WORMHOLE_PRUNE_INTERVAL", default_value_t = 3600.0)]
    pub prune_interval: f64,
}

/// Configuration for the `transit-relay` binary.
#[derive(Debug, Parser)]
#[command(name = "transit-relay", about = "Magic Wormhole transit relay")]
pub struct TransitConfig {
    /// `sqlx` SQLite connection string, for transit usage records.
    #[arg(long, env = "WORMHOLE_DB_URL", default_value = "sqlite::memory:")]
    pub db_url: String,

    /// Address to bind the TCP pairing listener on.
    #[arg(long, env = "WORMHOLE_TRANSIT_LISTEN", default_value = "127.0.0.1:4001")]
    pub listen: String,
}
