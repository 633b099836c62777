//! AegisMesh Server
//! ================
//! Main entry point for the central server: persists inventory, runs the
//! shield pipeline, enforces firewall rules, and aggregates collective
//! threat intelligence.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::format::json;

use aegis_mesh::gateway::{self, AppState};
use aegis_mesh::metrics::{init_metrics, update_system_metrics};
use aegis_mesh::store::{store_path_from_env, EntityStore};

#[derive(Debug, Parser)]
#[command(name = "aegis-server", about = "AegisMesh central server")]
struct Args {
    /// Bind address for the API gateway
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Emit logs as JSON (structured logging for collectors)
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    if args.json_logs {
        tracing_subscriber::fmt()
            .event_format(json())
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    init_metrics();
    info!("Prometheus metrics initialized");

    info!("Starting AegisMesh server v{}", env!("CARGO_PKG_VERSION"));

    // Open the entity store and recover scans orphaned by a dead process.
    let store = Arc::new(EntityStore::open(store_path_from_env())?);
    store.recover_stale_shield_scans()?;

    let state = AppState::new(Arc::clone(&store))?;

    // System metrics refresh task
    tokio::spawn(async {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            update_system_metrics();
        }
    });

    // Rate-limiter bucket reaper
    {
        let limiter = Arc::clone(&state.limiter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                let reaped = limiter.cleanup(Duration::from_secs(600));
                if reaped > 0 {
                    tracing::debug!("reaped {reaped} idle rate-limit buckets");
                }
            }
        });
    }

    // Collective signal TTL cleanup task
    {
        let collective = Arc::clone(&state.collective);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                if let Err(err) = collective.cleanup_expired() {
                    warn!("collective cleanup failed: {err}");
                }
            }
        });
    }

    // Dead-man-switch audit task
    {
        let deadman = Arc::clone(&state.deadman);
        let audit_store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                if let Err(err) = deadman.check_agents(&audit_store) {
                    warn!("dead-man-switch audit failed: {err}");
                }
            }
        });
    }

    info!("AegisMesh server initialized successfully");
    gateway::serve(state, &args.bind).await?;
    Ok(())
}
