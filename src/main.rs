use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use bftraft::config::Config;
use bftraft::consensus::node::RaftNode;
use bftraft::crypto;
use bftraft::logging;
use bftraft::state_machine::KvStore;
use bftraft::transport::tcp::{spawn_listener, TcpTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("keygen") => {
            let (private_key, public_key) = crypto::generate_keypair();
            println!("private_key = \"{private_key}\"");
            println!("public_key  = \"{public_key}\"");
            Ok(())
        }
        path => run(path.unwrap_or("config.toml")).await,
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let config =
        Config::load(config_path).with_context(|| format!("loading {config_path}"))?;

    let (filter, json) = config
        .logging
        .as_ref()
        .map(|log| (log.filter.clone(), log.json))
        .unwrap_or_else(|| ("bftraft=info".to_string(), false));
    logging::init(&filter, json);

    let keyring = Arc::new(config.keyring()?);
    let settings = config.node_settings();
    info!(
        node = %settings.id,
        peers = settings.peers.len(),
        quorum = settings.quorum_size,
        "configuration loaded"
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("listening on {}", config.listen_addr);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    spawn_listener(listener, events_tx.clone());

    let transport = Arc::new(TcpTransport::new(
        config.node_addrs(),
        config.client_addrs(),
    ));
    let mut node = RaftNode::new(
        settings,
        keyring,
        transport,
        KvStore::new(),
        &events_tx,
        events_rx,
    );

    tokio::select! {
        result = node.run() => result.context("replica stopped")?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }
    Ok(())
}
