//! A proof-of-work blockchain node.
//!
//! Starts a single node from command-line arguments; see [`USAGE`] or run
//! with `--help`.
//!
//! # Files
//! - `<data-dir>/blocks.db`: committed blocks, replayed on startup
//! - `<data-dir>/.lock`: held while the node runs
//! - `<data-dir>/node.key`: mining key (unless `--key` or `NODE_KEY_FILE`)

use powchain::config::{ConfigError, NodeConfig, USAGE};
use powchain::core::node::Node;
use powchain::crypto::key_pair::load_or_generate_key;
use powchain::network::server::Server;
use powchain::network::tcp_transport::TcpPeerClient;
use powchain::storage::block_store::FileBlockStore;
use powchain::utils::log;
use powchain::{error, info};
use std::env;
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("powchain");

    let config = match NodeConfig::from_args(args.get(1..).unwrap_or(&[])) {
        Ok(config) => config,
        Err(ConfigError::Help) => {
            print_usage(program);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{e}\n");
            print_usage(program);
            process::exit(1);
        }
    };
    log::set_level(config.log_level);

    let store = match FileBlockStore::open(&config.data_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open {}: {e}", config.data_dir.display());
            process::exit(1);
        }
    };

    let key = match load_or_generate_key(&config.key_file) {
        Ok(key) => key,
        Err(e) => {
            error!("Failed to load key {}: {e}", config.key_file.display());
            process::exit(1);
        }
    };

    let node = match Node::new(
        config.genesis.clone(),
        key.address(),
        config.advertise.clone(),
        Box::new(store),
    ) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("Failed to restore chain: {e}");
            process::exit(1);
        }
    };
    for peer in &config.peers {
        node.submit_peer(peer.clone());
    }

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.listen_addr);
            process::exit(1);
        }
    };

    let client = Arc::new(TcpPeerClient::new(config.peer_timeout));
    let server = Server::new(node, client, config.server_ops());
    info!(
        "Node {} listening on {} ({}, miner address {})",
        config.advertise,
        config.listen_addr,
        if config.mine { "mining" } else { "not mining" },
        key.address()
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server_handle = tokio::spawn(server.run(listener, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to set up Ctrl+C handler: {e}");
        return;
    }
    info!("Ctrl+C received, shutting down...");
    let _ = shutdown_tx.send(());
    if let Err(e) = server_handle.await {
        error!("Server task error: {e:?}");
    }
}

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
