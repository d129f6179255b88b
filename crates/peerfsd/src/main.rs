//! peerfsd: peerfs node daemon.
//!
//! Usage: peerfsd [FILE]...
//!
//! Joins the network, publishes each FILE once the new-node window has
//! closed, logs the directory periodically and leaves cleanly on Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use peerfs_core::config::PeerfsConfig;
use peerfs_node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PeerfsConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PeerfsConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PeerfsConfig::default()
    });

    let uploads: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    tracing::info!(
        config = %PeerfsConfig::file_path().display(),
        uploads = uploads.len(),
        "peerfsd starting"
    );

    let node = Node::bind(&config).context("failed to set up node")?;
    node.start_session().await.context("failed to join the network")?;

    // Publish after the directory has settled so collisions are detected.
    let uploader = {
        let node = node.clone();
        let settle = config.session.grace_period();
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            for path in uploads {
                match node.upload_file(&path).await {
                    Ok(d) => tracing::info!(
                        path = %path.display(),
                        hash = %d.content_hash,
                        holder = %node.format_address(d.holder),
                        "published"
                    ),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "upload failed"),
                }
            }
        })
    };

    let snapshot_printer = {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let files = node.network_descriptors();
                tracing::info!(
                    peers = node.peers().len(),
                    files = files.len(),
                    local = node.local_descriptors().len(),
                    "directory snapshot"
                );
                for d in &files {
                    tracing::info!(
                        name = %d.name,
                        hash = %d.content_hash,
                        size = d.size,
                        holder = %node.format_address(d.holder),
                        owner = %node.format_address(d.owner),
                        valid = d.valid,
                        "  file"
                    );
                }
            }
        })
    };

    let mut events = node.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(event = ?event, "node event"),
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");

    uploader.abort();
    snapshot_printer.abort();
    node.end_session().await.context("failed to leave the network")?;
    event_logger.abort();

    Ok(())
}
