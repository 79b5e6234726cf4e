//! Antler - Embeddable Highly Available Graph Database
//!
//! Node binary: runs a cluster node, the coordination service, or
//! small operational helpers around a configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use antler::config::AntlerConfig;
use antler::coord::{CoordClient, CoordServer, CoordinationService};
use antler::error::{Error, Result};
use antler::ha::ClusterGraphDb;

/// Antler - Embeddable Highly Available Graph Database
#[derive(Parser)]
#[command(name = "antler")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "antler.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster node
    Start,

    /// Run the coordination service
    Coord {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:2181")]
        listen: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "antler.toml")]
        output: PathBuf,

        /// Machine id for this node
        #[arg(long, default_value_t = 1)]
        machine_id: u32,
    },

    /// Validate the configuration file
    Validate,

    /// Show the cluster view from the coordination service
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = AntlerConfig::from_file(&cli.config)?;
            init_logging(&cli.log_level, Some(&config));
            run_start(config).await
        }
        Commands::Coord { listen } => {
            init_logging(&cli.log_level, None);
            run_coord(listen).await
        }
        Commands::Init { output, machine_id } => {
            init_logging(&cli.log_level, None);
            run_init(output, machine_id)
        }
        Commands::Validate => {
            init_logging(&cli.log_level, None);
            let config = AntlerConfig::from_file(&cli.config)?;
            println!(
                "configuration valid: machine {} in cluster '{}'",
                config.node.machine_id, config.cluster.cluster_name
            );
            Ok(())
        }
        Commands::Status => {
            init_logging(&cli.log_level, None);
            let config = AntlerConfig::from_file(&cli.config)?;
            run_status(config).await
        }
    }
}

fn init_logging(level: &str, config: Option<&AntlerConfig>) {
    let level = config
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|| level.to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let messages_log = config.filter(|c| c.logging.messages_log).and_then(|c| {
        std::fs::create_dir_all(c.store_dir()).ok()?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(c.store_dir().join("messages.log"))
            .ok()
    });

    match messages_log {
        Some(file) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => registry.init(),
    }
}

async fn run_start(config: AntlerConfig) -> Result<()> {
    if !config.is_clustered() {
        return Err(Error::Config(
            "cluster.coordination_servers is empty; a cluster node needs a coordination service"
                .into(),
        ));
    }

    tracing::info!(
        machine = config.node.machine_id,
        cluster = %config.cluster.cluster_name,
        store = %config.store_dir().display(),
        "starting antler node"
    );

    let node = tokio::task::spawn_blocking(move || {
        let coordination: Arc<dyn CoordinationService> = CoordClient::new(
            config.cluster.coordination_servers.clone(),
            config.session_ttl(),
        );
        ClusterGraphDb::open(config, coordination)
    })
    .await
    .map_err(|e| Error::Internal(format!("startup task panicked: {e}")))??;

    tracing::info!(primary = node.is_primary(), "node running");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("signal handler: {e}")))?;
    tracing::info!("shutting down");

    tokio::task::spawn_blocking(move || node.shutdown())
        .await
        .map_err(|e| Error::Internal(format!("shutdown task panicked: {e}")))?;
    Ok(())
}

async fn run_coord(listen: String) -> Result<()> {
    let server = CoordServer::new(listen, std::time::Duration::from_secs(5));
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::select! {
        result = server.run(shutdown_rx) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| Error::Internal(format!("signal handler: {e}")))?;
            tracing::info!("coordination service shutting down");
            Ok(())
        }
    }
}

fn run_init(output: PathBuf, machine_id: u32) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!(
            "{} already exists",
            output.display()
        )));
    }
    let content = format!(
        r#"[node]
machine_id = {machine_id}
store_dir = "data"
# ha_server = "0.0.0.0:6361"

[cluster]
coordination_servers = ["127.0.0.1:2181"]
# pull_interval = "10s"
allow_init_cluster = true

[store]
# use_memory_mapped_buffers = true

[logging]
level = "info"
"#
    );
    std::fs::write(&output, content)?;
    println!("wrote {}", output.display());
    Ok(())
}

async fn run_status(config: AntlerConfig) -> Result<()> {
    let view = tokio::task::spawn_blocking(move || {
        let client = CoordClient::new(
            config.cluster.coordination_servers.clone(),
            config.session_ttl(),
        );
        let view = client.view();
        client.shutdown();
        view
    })
    .await
    .map_err(|e| Error::Internal(format!("status task panicked: {e}")))??;

    println!("epoch:   {}", view.epoch);
    match &view.primary {
        Some((seq, member)) => println!(
            "primary: machine {} at {} (seq {seq})",
            member.machine_id, member.ha_address
        ),
        None => println!("primary: none elected"),
    }
    println!("members:");
    for (seq, member) in &view.members {
        println!(
            "  seq {seq}: machine {} at {}{}",
            member.machine_id,
            member.ha_address,
            if member.backup_only { " (backup)" } else { "" }
        );
    }
    Ok(())
}
