//! StewardCtl - Command line tool for inspecting Steward clusters
//!
//! Usage:
//!   stewardctl list members    - Show cluster member status
//!   stewardctl status          - Show local node status
//!   stewardctl topology        - Show the published routing record
//!   stewardctl failover        - Ask the local node to step down (if leader)

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;

/// Steward Cluster Control Tool
#[derive(Parser)]
#[command(name = "stewardctl")]
#[command(about = "Inspect and control Steward failover clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/steward/steward.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cluster members and their status
    List {
        #[command(subcommand)]
        what: ListSubcommand,
    },
    /// Show status of the local node
    Status,
    /// Show the published topology record
    Topology,
    /// Request a manual failover (the local node steps down if leader)
    Failover {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ListSubcommand {
    /// List all members in the cluster
    Members,
}

// ============ API Response Types ============

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct ClusterInfoResponse {
    #[serde(default)]
    members: Vec<MemberInfo>,
    #[serde(default)]
    leader_name: Option<String>,
    #[serde(default)]
    epoch: Option<u64>,
    #[serde(default)]
    last_failover_reason: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct MemberInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    health: String,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    lag: u64,
}

#[derive(Debug, Deserialize)]
struct AdminResponse {
    success: bool,
    message: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8008".to_string()
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Determine API endpoint
    let endpoint = match &cli.endpoint {
        Some(e) => e.clone(),
        None => {
            if cli.config.exists() {
                match std::fs::read_to_string(&cli.config) {
                    Ok(content) => match toml::from_str::<Config>(&content) {
                        Ok(config) => {
                            let addr = config.api.bind_address;
                            if addr.starts_with("0.0.0.0") {
                                format!(
                                    "http://127.0.0.1:{}",
                                    addr.split(':').nth(1).unwrap_or("8008")
                                )
                            } else {
                                format!("http://{}", addr)
                            }
                        }
                        Err(_) => "http://127.0.0.1:8008".to_string(),
                    },
                    Err(_) => "http://127.0.0.1:8008".to_string(),
                }
            } else {
                "http://127.0.0.1:8008".to_string()
            }
        }
    };

    let result = match &cli.command {
        Commands::List { what } => match what {
            ListSubcommand::Members => list_members(&endpoint).await,
        },
        Commands::Status => show_status(&endpoint).await,
        Commands::Topology => show_topology(&endpoint).await,
        Commands::Failover { force } => manual_failover(&endpoint, *force).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

async fn list_members(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/cluster", endpoint);
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let info: ClusterInfoResponse = response.json().await?;

    println!();
    println!(
        "Steward Cluster Status (stewardctl v{})",
        env!("CARGO_PKG_VERSION")
    );
    println!("========================================");
    println!();
    match (&info.leader_name, info.epoch) {
        (Some(leader), Some(epoch)) => println!("Leader: {}  |  Epoch: {}", leader, epoch),
        _ => println!("Leader: NONE"),
    }
    if let Some(reason) = &info.last_failover_reason {
        println!("Last failover: {}", reason);
    }
    println!();

    println!(
        "{:<16} {:<22} {:<12} {:<12} {:>10} {:>8}",
        "MEMBER", "ADDRESS", "ROLE", "HEALTH", "OFFSET", "LAG"
    );
    println!("{}", "-".repeat(84));

    for member in &info.members {
        // Pad before adding color codes so the columns stay aligned
        let health_padded = format!("{:<12}", member.health);
        let health_colored = match member.health.as_str() {
            "healthy" => format!("\x1b[32m{}\x1b[0m", health_padded),
            "degraded" => format!("\x1b[33m{}\x1b[0m", health_padded),
            "unreachable" => format!("\x1b[31m{}\x1b[0m", health_padded),
            _ => health_padded,
        };

        let role_padded = format!("{:<12}", member.role);
        let role_colored = match member.role.as_str() {
            "leader" => format!("\x1b[1;34m{}\x1b[0m", role_padded),
            "fenced" => format!("\x1b[31m{}\x1b[0m", role_padded),
            _ => role_padded,
        };

        println!(
            "{:<16} {:<22} {} {} {:>10} {:>8}",
            member.name, member.address, role_colored, health_colored, member.offset, member.lag
        );
    }
    println!();

    Ok(())
}

async fn show_status(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/status", endpoint);
    let response = reqwest::get(&url).await?;
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let status: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn show_topology(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/topology", endpoint);
    let response = reqwest::get(&url).await?;

    if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
        println!("No leader published (failover may be in progress)");
        return Ok(());
    }
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let topology: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&topology)?);
    Ok(())
}

async fn manual_failover(endpoint: &str, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !force {
        print!("Request the current leader to step down? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted");
            return Ok(());
        }
    }

    let url = format!("{}/admin/failover", endpoint);
    let client = reqwest::Client::new();
    let response = client.post(&url).send().await?;

    if response.status() == reqwest::StatusCode::CONFLICT {
        return Err("this node is not the leader; run against the leader's endpoint".into());
    }
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let reply: AdminResponse = response.json().await?;
    if reply.success {
        println!("{}", reply.message);
        Ok(())
    } else {
        Err(reply.message.into())
    }
}

fn check_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = steward::StewardConfig::from_file(path)?;
    println!("✓ Configuration is valid");
    println!("  Member Name:   {}", config.node.name);
    println!("  Store Backend: {}", config.store.backend);
    println!("  Lease TTL:     {} ms", config.failover.lease_ttl_ms);
    Ok(())
}
