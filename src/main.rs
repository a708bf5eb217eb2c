//! Steward - Automatic Database Failover Controller
//!
//! Runs the per-node control loops: health probing, the election state
//! machine, the member registry cache and the operator HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use steward::api::HttpServer;
use steward::cluster::MemberRegistry;
use steward::config::StewardConfig;
use steward::coord::{CoordinationStore, HttpStore, MemoryStore};
use steward::db::{DatabaseManager, MariaDbManager};
use steward::election::ElectionEngine;
use steward::error::Result;
use steward::failover::FailoverOrchestrator;
use steward::health::HealthMonitor;

/// Steward - Automatic Database Failover Controller
#[derive(Parser)]
#[command(name = "steward")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "steward.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Steward node
    Start,

    /// Check node status over the HTTP API
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:8008")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "steward.toml")]
        output: PathBuf,

        /// Member name
        #[arg(long, default_value = "node-1")]
        name: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, name } => run_init(output, name),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the Steward node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting Steward node...");

    let config = match StewardConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for member: {}", config.node.name);

    // Coordination store client
    let store: Arc<dyn CoordinationStore> = match config.store.backend.as_str() {
        "memory" => {
            tracing::warn!("Using the in-process coordination store; safe only for a single node");
            Arc::new(MemoryStore::new())
        }
        _ => Arc::new(HttpStore::new(&config.store, config.probe_interval())?),
    };

    // Database management collaborator
    tracing::info!(
        "Connecting to database at {}:{}...",
        config.database.host,
        config.database.port
    );
    let db: Arc<dyn DatabaseManager> = match MariaDbManager::new(&config.database).await {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::error!("Failed to connect to database: {}", e);
            tracing::error!("  Host: {}:{}", config.database.host, config.database.port);
            tracing::error!("  User: {}", config.database.user);
            return Err(e);
        }
    };

    // Member registry, hydrated from the store and kept current via watch
    let registry = Arc::new(MemberRegistry::new(
        config.node.name.clone(),
        config.staleness_bound(),
        Arc::clone(&store),
    ));
    registry
        .register_self(config.node.advertise_address.clone())
        .await?;
    tracing::info!(
        "Registered member {} at {}",
        config.node.name,
        config.node.advertise_address
    );

    let orchestrator = Arc::new(FailoverOrchestrator::new(
        config.node.name.clone(),
        config.node.advertise_address.clone(),
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&db),
        config.failover.max_lag_on_failover,
    ));

    let engine = Arc::new(ElectionEngine::new(
        config.node.name.clone(),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&orchestrator),
        Arc::clone(&db),
        config.lease_ttl(),
        config.grace_window(),
    ));

    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        &config,
    ));

    let http_server = HttpServer::new(
        config.api.clone(),
        config.node.name.clone(),
        Arc::clone(&registry),
        Arc::clone(&engine),
        Arc::clone(&orchestrator),
    );

    // Cooperative shutdown: every loop watches the same channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let registry_task = {
        let registry = Arc::clone(&registry);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { registry.run(rx).await })
    };

    let monitor_task = {
        let monitor = Arc::clone(&monitor);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(rx).await })
    };

    let engine_task = {
        let engine = Arc::clone(&engine);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(rx).await })
    };

    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    // A departing leader demotes and releases its lease before exit so the
    // next election is not delayed by a stale claim's TTL
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        tracing::warn!("Election engine exited abnormally: {}", e);
    }
    if let Err(e) = registry.deregister_self().await {
        tracing::warn!("Could not deregister member record: {}", e);
    }

    monitor_task.abort();
    registry_task.abort();
    http_task.abort();

    tracing::info!("Steward shutdown complete");
    Ok(())
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| steward::Error::Http(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(steward::Error::Http(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, name: String) -> Result<()> {
    let config_content = format!(
        r#"# Steward Configuration
# Generated configuration file

[node]
name = "{name}"
# Database endpoint advertised to routers (this node's database, not Steward)
advertise_address = "127.0.0.1:3306"

[database]
host = "localhost"
port = 3306
user = "steward"
password = "changeme"
pool_size = 5
connect_timeout_secs = 10

[store]
# Coordination store: "http" (external KV service) or "memory" (single node)
backend = "http"
endpoint = "http://127.0.0.1:2379"
namespace = "steward"
request_timeout_ms = 2000

[failover]
lease_ttl_ms = 10000
grace_ms = 2000
probe_interval_ms = 3000
probe_latency_warn_ms = 1000
failure_threshold = 3
lag_warn_threshold = 1000
# Maximum lag a standby may carry and still be promoted (0 = no bound)
max_lag_on_failover = 0
missed_heartbeat_factor = 2

[api]
enabled = true
bind_address = "0.0.0.0:8008"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
# file = "/var/log/steward/steward.log"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your database and coordination store.");
    println!("Then start with: steward start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match StewardConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Member Name:     {}", config.node.name);
            println!("  Advertise:       {}", config.node.advertise_address);
            println!(
                "  Database:        {}@{}:{}",
                config.database.user, config.database.host, config.database.port
            );
            println!("  Store Backend:   {}", config.store.backend);
            println!("  Lease TTL:       {} ms", config.failover.lease_ttl_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = StewardConfig::from_file(&config_path)?;

    println!("Steward Node Information");
    println!("========================");
    println!();
    println!("Member Name:      {}", config.node.name);
    println!("Advertise:        {}", config.node.advertise_address);
    println!();
    println!("Database Configuration:");
    println!(
        "  Host:           {}:{}",
        config.database.host, config.database.port
    );
    println!("  Pool Size:      {}", config.database.pool_size);
    println!();
    println!("Coordination Store:");
    println!("  Backend:        {}", config.store.backend);
    println!("  Endpoint:       {}", config.store.endpoint);
    println!("  Namespace:      {}", config.store.namespace);
    println!();
    println!("Failover Policy:");
    println!("  Lease TTL:      {} ms", config.failover.lease_ttl_ms);
    println!("  Grace Window:   {} ms", config.failover.grace_ms);
    println!("  Probe Interval: {} ms", config.failover.probe_interval_ms);
    println!(
        "  Max Lag:        {}",
        if config.failover.max_lag_on_failover == 0 {
            "unbounded".to_string()
        } else {
            config.failover.max_lag_on_failover.to_string()
        }
    );

    Ok(())
}
