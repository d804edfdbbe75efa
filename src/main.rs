//! Quotient server
//!
//! Run with: cargo run [-- path/to/quotient.config.yaml]
//!
//! The config file defaults to `quotient.config.yaml` in the working
//! directory; when the default file is absent the built-in defaults apply
//! (single node, q = 22, port 8080). See `config` for every option.
//!
//! Environment variables:
//! - RUST_LOG: Log level (default: info)

use std::path::Path;
use std::sync::Arc;

use quotient::api::{run_server, AppState};
use quotient::config::{Config, DEFAULT_CONFIG_FILE};
use quotient::filter::QuotientFilter;
use quotient::raft::{self, FilterFsm};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotient=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // An explicit config path must exist; the default path is optional.
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Config::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => {
            tracing::warn!("no {DEFAULT_CONFIG_FILE} found, using defaults");
            Config::default()
        }
    };

    tracing::info!("Quotient configuration:");
    tracing::info!("  Filter: q={} ({} slots)", config.quotient.log_size, 1u64 << config.quotient.log_size);
    tracing::info!("  HTTP port: {}", config.server.port);
    tracing::info!("  Node ID: {}", config.raft.node_id);
    tracing::info!("  Raft address: {}", config.raft.tcp_address);
    tracing::info!("  Heartbeat timeout: {:?}", config.raft.heartbeat_timeout());
    tracing::info!("  Log dir: {}", config.raft.log_dir);
    tracing::info!("  Snapshot dir: {}", config.raft.snapshot_dir);
    if config.raft.peer_addresses.is_empty() {
        tracing::info!("  Cluster mode: DISABLED (single node)");
    } else {
        tracing::info!("  Peers: {}", config.raft.peer_addresses.len());
        for peer in &config.raft.peer_addresses {
            tracing::info!("    - {} @ {} (http {})", peer.id, peer.raft_addr, peer.http_addr);
        }
    }

    let filter = Arc::new(QuotientFilter::new(config.quotient.log_size)?);
    let fsm = Box::new(FilterFsm::new(Arc::clone(&filter)));
    let raft = raft::spawn(&config.raft, fsm)?;

    let state = Arc::new(AppState {
        filter,
        raft,
        node_id: config.raft.node_id,
        http_client: reqwest::Client::new(),
    });

    println!(
        r#"
   ____              _   _            _
  / __ \            | | (_)          | |
 | |  | |_   _  ___ | |_ _  ___ _ __ | |_
 | |  | | | | |/ _ \| __| |/ _ \ '_ \| __|
 | |__| | |_| | (_) | |_| |  __/ | | | |_
  \___\_\\__,_|\___/ \__|_|\___|_| |_|\__|

 Replicated Approximate Set Membership
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    run_server(config.server.port, state).await
}
