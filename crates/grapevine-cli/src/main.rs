//! Grapevine CLI
//!
//! Runs a single gossip peer from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Run a peer, bootstrapping from another one
//! grapevine serve --seed 127.0.0.1:8911
//!
//! # Run a peer that answers searches
//! grapevine serve --answer "I play chess"
//!
//! # Gossip a search and print answers for ten seconds
//! grapevine search "chess partner" --seed 127.0.0.1:8911 --timeout 10
//!
//! # Show the effective configuration
//! grapevine config
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grapevine_core::{
    AccountId, ClientCallback, Contact, Grapevine, GrapevineConfig, SearchId, SharedDataId,
    SharedDataProxy,
};

/// Grapevine - peer-to-peer gossip and shared data
#[derive(Parser)]
#[command(name = "grapevine")]
#[command(version)]
#[command(about = "Grapevine - peer-to-peer gossip and shared data")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a peer until Ctrl+C
    Serve {
        /// Peer to gossip with, as host:port (repeatable)
        #[arg(short, long)]
        seed: Vec<String>,

        /// Account name to advertise
        #[arg(short, long)]
        account: Option<String>,

        /// Answer every search with this text
        #[arg(long)]
        answer: Option<String>,

        /// Accept shared data invitations
        #[arg(long)]
        accept_invites: bool,
    },

    /// Gossip a search and print the answers
    Search {
        /// Search text
        query: String,

        /// Peer to gossip with, as host:port (repeatable)
        #[arg(short, long)]
        seed: Vec<String>,

        /// Seconds to wait for answers
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Prints everything the node reports
struct ConsoleCallback {
    answer: Option<String>,
    accept_invites: bool,
}

impl ClientCallback for ConsoleCallback {
    fn on_search(&self, _id: SearchId, query: &str) -> bool {
        println!("Search: {}", query);
        self.answer.is_some()
    }

    fn search_response(&self, _id: SearchId, _query: &str) -> String {
        self.answer.clone().unwrap_or_default()
    }

    fn on_search_result(&self, _id: SearchId, response: &str, responder: &Contact) {
        println!("  {} -> {}", responder, response);
    }

    fn on_invited(&self, id: SharedDataId, role: &str, inviter: &Contact) -> bool {
        println!(
            "Invited to {} as {} by {} ({})",
            id,
            role,
            inviter,
            if self.accept_invites { "accepted" } else { "declined" }
        );
        self.accept_invites
    }

    fn on_shared_data_available(&self, shared_data: &SharedDataProxy) {
        println!("Replicating {}", shared_data.id());
        shared_data.on_data_change(|key| println!("  changed: {}", key));
    }
}

fn load_config(cli: &Cli, seeds: &[String]) -> Result<GrapevineConfig> {
    let mut config = GrapevineConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.seeds.extend(seeds.iter().cloned());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    grapevine_core::logging::init(cli.verbose);

    match &cli.command {
        Commands::Serve {
            seed,
            account,
            answer,
            accept_invites,
        } => {
            let config = load_config(&cli, seed)?;
            let node = Grapevine::new(
                config,
                Arc::new(ConsoleCallback {
                    answer: answer.clone(),
                    accept_invites: *accept_invites,
                }),
            );
            if let Some(account) = account {
                node.set_account(AccountId::new(account.as_str()));
            }

            let addr = node.start().await.context("Failed to start node")?;
            println!("Grapevine peer running");
            println!("  Address: {}", addr);
            println!("  Contact: {}", node.me());
            println!();
            println!("Press Ctrl+C to stop.");

            let status_interval = Duration::from_secs(30);
            let mut last_status = std::time::Instant::now();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if last_status.elapsed() >= status_interval {
                            last_status = std::time::Instant::now();
                            let info = node.info();
                            tracing::info!(
                                mongers = info.mongers.len(),
                                rumors = info.rumors,
                                shared_data = info.shared_data.len(),
                                connections = info.cached_connections,
                                "Status"
                            );
                        }
                    }
                }
            }

            node.shutdown();
            println!("Stopped.");
        }

        Commands::Search {
            query,
            seed,
            timeout,
        } => {
            let config = load_config(&cli, seed)?;
            if config.seeds.is_empty() {
                anyhow::bail!("No peers to search: pass --seed or set seeds in the config");
            }
            let node = Grapevine::new(
                config,
                Arc::new(ConsoleCallback {
                    answer: None,
                    accept_invites: false,
                }),
            );
            node.start().await.context("Failed to start node")?;

            let id = node.search(query);
            println!("Searching for \"{}\" ({})", query, id);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(Duration::from_secs(*timeout)) => {}
            }
            node.shutdown();
        }

        Commands::Config => {
            let config = load_config(&cli, &[])?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
