//! WolfLeader - Session-Based Leader Election for Consul
//!
//! Runs one election contender and exposes its view over HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfleader::api::HttpServer;
use wolfleader::config::{LoggingConfig, WolfLeaderConfig};
use wolfleader::coordination::{ConsulClient, Coordinator};
use wolfleader::error::{Error, Result};
use wolfleader::identity::{self, ServiceIdentity};
use wolfleader::node::LeaderElection;

/// WolfLeader - Session-Based Leader Election for Consul
#[derive(Parser)]
#[command(name = "wolfleader")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfleader.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the election and run until interrupted
    Run,

    /// Show the current leader of the configured service
    Status,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfleader.toml")]
        output: PathBuf,

        /// Service name
        #[arg(long, default_value = "my-service")]
        name: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_node(cli.config, cli.log_level).await,
        Commands::Status => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref())?;
            run_status(cli.config).await
        }
        Commands::Init { output, name } => run_init(output, name),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = level_override.unwrap_or(logging.level.as_str());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(Arc::new(file))
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init();
    }
    Ok(())
}

fn load_config(config_path: &Path) -> Result<WolfLeaderConfig> {
    match WolfLeaderConfig::from_file(config_path) {
        Ok(c) => Ok(c),
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            Err(e)
        }
    }
}

/// Run an election contender
async fn run_node(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config.logging, log_level.as_deref())?;
    tracing::info!("Loaded configuration for service: {}", config.service.name);

    let client = ConsulClient::new(&config.consul)?;
    tracing::info!("Using Consul agent at {}", client.address());
    let coordinator: Arc<dyn Coordinator> = Arc::new(client);

    let node = Arc::new(LeaderElection::from_config(&config, coordinator)?);
    let cancel = CancellationToken::new();

    let api_cancel = cancel.child_token();
    let api = HttpServer::new(config.api.clone(), node.identity().clone(), node.subscribe());
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.start(api_cancel).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let election = {
        let node = Arc::clone(&node);
        let cancel = cancel.clone();
        tokio::spawn(async move { node.run(cancel).await })
    };
    tokio::pin!(election);

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            cancel.cancel();
            (&mut election).await
        }
        result = &mut election => {
            cancel.cancel();
            result
        }
    };

    if let Err(e) = api_handle.await {
        tracing::warn!("HTTP API task ended abnormally: {}", e);
    }

    match result {
        Ok(Ok(())) => {
            tracing::info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("Election failed: {}", e);
            Err(e)
        }
        Err(e) => Err(Error::Io(std::io::Error::other(e))),
    }
}

/// Print the current leader of the configured service
async fn run_status(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let client = ConsulClient::new(&config.consul)?;
    let key = identity::leader_key(&config.service.name);

    let observation = match client.read_key(&key).await {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Failed to read {}: {}", key, e);
            return Err(e);
        }
    };

    println!("Service:  {}", config.service.name);
    println!("Key:      {}", key);
    println!("Index:    {}", observation.index);
    match observation.lock_holder() {
        Some(session) => {
            let leader = observation
                .value()
                .and_then(|raw| ServiceIdentity::decode(&config.service.name, raw));
            match leader {
                Some(leader) => println!("Leader:   {}", leader),
                None => println!("Leader:   (unknown)"),
            }
            println!("Session:  {}", session);
        }
        None => println!("Leader:   (none)"),
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, name: String) -> Result<()> {
    if output.exists() {
        eprintln!("✗ {:?} already exists", output);
        return Err(Error::Config(format!("{:?} already exists", output)));
    }

    let content = WolfLeaderConfig::template(&name);
    // Refuse to write a template that would not load back
    WolfLeaderConfig::from_str(&content)?;
    std::fs::write(&output, content)?;
    println!("Configuration file created: {:?}", output);
    println!("Edit the [consul] section to point at your agent, then run `wolfleader run`.");
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfLeaderConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Service:        {}", config.service.name);
            println!("  Leader Key:     {}", identity::leader_key(&config.service.name));
            println!("  Consul:         {}", config.consul.address);
            println!("  Check TTL:      {}s", config.check.ttl_secs);
            println!("  Heartbeat:      {}s", config.check.heartbeat_interval_secs);
            println!("  Lock Delay:     {}s", config.election.lock_delay_secs);
            println!(
                "  HTTP API:       {}",
                if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
