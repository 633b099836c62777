//! AegisMesh Agent
//! ===============
//! Remote scanner daemon: registers with the central server, scans its
//! authoritative subnets, and pushes results over HTTPS.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use aegis_mesh::agent::client::AgentApiClient;
use aegis_mesh::agent::daemon::{rotate_log_if_needed, AgentDaemon, DaemonConfig, StubScanner};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn default_data_dir() -> PathBuf {
    dirs_home().join(".aegis-mesh")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Parser)]
#[command(name = "aegis-agent", about = "AegisMesh remote scanner agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register with the server and print the one-time token
    Register {
        /// Base URL of the AegisMesh server
        #[arg(long)]
        api_url: String,
        /// Display name for this agent
        #[arg(long)]
        name: String,
        /// Site label used to group this agent's assets
        #[arg(long, default_value = "")]
        site_name: String,
        /// Subnet CIDRs this agent is authoritative for
        #[arg(long)]
        subnet: Vec<String>,
        /// Registration secret, when the server enforces one
        #[arg(long)]
        secret: Option<String>,
    },
    /// Run the scan/push daemon loop
    Run {
        #[arg(long)]
        api_url: String,
        /// Bearer token issued at registration
        #[arg(long)]
        token: String,
        /// Subnet CIDRs to scan each cycle
        #[arg(long)]
        target: Vec<String>,
        /// Seconds between scan cycles
        #[arg(long, default_value_t = 300)]
        interval: u64,
        /// Also run shield security modules after discovery
        #[arg(long)]
        shield: bool,
        /// State directory (PID file, log, offline queue)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Show daemon status from the PID file
    Status {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Register {
            api_url,
            name,
            site_name,
            subnet,
            secret,
        } => {
            let (agent_id, token) =
                AgentApiClient::register(&api_url, &name, &site_name, &subnet, secret.as_deref())
                    .await?;
            println!("agent_id: {agent_id}");
            println!("token:    {token}");
            println!("Store the token securely; it cannot be retrieved again.");
        }
        Command::Run {
            api_url,
            token,
            target,
            interval,
            shield,
            data_dir,
        } => {
            let data_dir = data_dir.unwrap_or_else(default_data_dir);
            rotate_log_if_needed(&data_dir.join("agent.log"));

            let daemon = AgentDaemon::new(
                DaemonConfig {
                    api_url,
                    token,
                    targets: target,
                    interval: Duration::from_secs(interval),
                    shield,
                    data_dir,
                },
                Arc::new(StubScanner),
            )?;

            // Ctrl-C clears the running flag; the loop notices at the next
            // chunked-sleep boundary.
            let running = daemon.running_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    running.store(false, std::sync::atomic::Ordering::SeqCst);
                }
            });

            daemon.start().await?;
        }
        Command::Status { data_dir } => {
            let data_dir = data_dir.unwrap_or_else(default_data_dir);
            let daemon = AgentDaemon::new(
                DaemonConfig {
                    api_url: "http://localhost".to_string(),
                    token: String::new(),
                    targets: vec![],
                    interval: Duration::from_secs(300),
                    shield: false,
                    data_dir,
                },
                Arc::new(StubScanner),
            )?;
            println!("{}", daemon.status());
        }
    }

    Ok(())
}
