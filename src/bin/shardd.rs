//! minishard server binary
//!
//! `shardd local` runs a whole coordination cluster in one process over the
//! in-memory discovery store: N registrars, the assigner (or one roler per
//! server), and a resolver printing the converged routing table. Useful for
//! demos and for watching a reconfiguration play out.

use clap::{Parser, Subcommand};
use minishard::{Addresser, ClusterConfig, Config, MemoryDiscovery, MemoryEngine, Roler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardd")]
#[command(about = "minishard shard-role coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster over the in-memory discovery store
    Local {
        /// Number of servers to run
        #[arg(long, default_value = "3")]
        servers: usize,

        /// Number of shards in the shard space
        #[arg(long, default_value = "16")]
        shards: u64,

        /// Replicas per shard
        #[arg(long, default_value = "1")]
        replicas: u64,

        /// Server state lease (e.g. "20s")
        #[arg(long, default_value = "20s")]
        hold_ttl: String,

        /// Discovery namespace
        #[arg(long, default_value = "minishard")]
        namespace: String,

        /// Balance with per-server rolers instead of the assigner
        #[arg(long)]
        roler: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the config file
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Local {
            servers,
            shards,
            replicas,
            hold_ttl,
            namespace,
            roler,
        } => {
            let hold_ttl = minishard::common::parse_duration(&hold_ttl)?;
            let cluster = ClusterConfig {
                namespace,
                num_shards: shards,
                num_replicas: replicas,
                hold_ttl_secs: hold_ttl.as_secs(),
                ..ClusterConfig::default()
            };
            cluster.validate()?;
            let discovery = Arc::new(MemoryDiscovery::new());
            let addresser = Arc::new(Addresser::new(
                discovery,
                cluster.sharder()?,
                cluster.namespace.clone(),
                cluster.hold_ttl(),
            ));
            let (shutdown_tx, _) = broadcast::channel::<()>(1);
            let mut tasks = tokio::task::JoinSet::new();

            let ids: Vec<String> = (0..servers).map(|i| format!("server-{}", i)).collect();
            for (i, id) in ids.iter().enumerate() {
                let address = format!("127.0.0.1:{}", 7000 + i);
                let engine = Arc::new(MemoryEngine::new());
                if roler {
                    let balancer =
                        Roler::new(addresser.clone(), engine, address, cluster.roler_tick());
                    let shutdown = shutdown_tx.subscribe();
                    tasks.spawn(async move {
                        let _ = balancer.run(shutdown).await;
                    });
                } else {
                    let addresser = addresser.clone();
                    let id = id.clone();
                    let shutdown = shutdown_tx.subscribe();
                    tasks.spawn(async move {
                        let _ = addresser.register(&id, &address, engine, shutdown).await;
                    });
                }
            }
            if !roler {
                let assigner = addresser.clone();
                let shutdown = shutdown_tx.subscribe();
                tasks.spawn(async move {
                    let _ = assigner.assign_roles(shutdown).await;
                });

                addresser
                    .wait_for_availability(&ids, shutdown_tx.subscribe())
                    .await?;
                let version = addresser
                    .version()
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no servers registered"))?;
                tracing::info!(version, "cluster available");
                for (shard, master) in addresser.get_shard_to_master_address(version).await? {
                    let replicas = addresser.get_replica_addresses(shard, version).await?;
                    tracing::info!(shard, master = %master, replicas = ?replicas, "assignment");
                }
            }

            tracing::info!("running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(());
            while tasks.join_next().await.is_some() {}
        }

        Commands::Validate { config } => {
            let config = Config::from_file(&config)?;
            config.validate()?;
            println!("{} ok: server {} at {}", config.cluster.namespace, config.server_id, config.address);
        }
    }

    Ok(())
}
