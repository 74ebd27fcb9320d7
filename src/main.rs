use anyhow::{Context, Result};
use cerrojo::cluster::{Elector, ElectorSettings, NoDecryptor, NodeRegistry};
use cerrojo::config::{Config, ConfigError, LoggingConfig};
use cerrojo::Coordinator;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cerrojo")]
#[command(about = "Distributed locks, throttling and quotas over Redis-compatible replicas")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, elect a master and keep checking health until Ctrl-C
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run one election and print the master
    Elect {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Elect { config } => elect_once(config).await?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config.logging)?;

    info!("Starting cerrojo v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Store nodes: {}", config.store.nodes.len());

    let mut coordinator = Coordinator::connect(config)
        .await
        .context("Failed to start coordinator")?;

    let monitor = Arc::clone(coordinator.monitor());
    let checks = coordinator.health_checks();
    let health = tokio::spawn(async move { monitor.run(checks).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    health.abort();
    coordinator.shutdown();
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the node entries to match your environment and run:");
    println!("  cerrojo run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Master key: {}", config.store.master_key);
            println!(
                "  Retry: {} retries, {} ms backoff",
                config.retry.max_retries, config.retry.backoff_ms
            );
            println!("  Blacklist backend: {:?}", config.blacklist.backend);
            println!("  Store nodes: {} instances", config.store.nodes.len());
            for (name, entry) in &config.store.nodes {
                // never print the credential part
                let addr = entry.rsplit_once('@').map_or(entry.as_str(), |(_, addr)| addr);
                println!("    {}: {}", name, addr);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

async fn elect_once(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config.logging)?;

    let registry = Arc::new(NodeRegistry::from_config(&config.store, &NoDecryptor)?);
    let settings = ElectorSettings {
        master_key: config.store.master_key.clone(),
        ..Default::default()
    };
    let elector = Elector::new(registry, settings);

    match elector.elect("cli").await {
        Some(master) => {
            println!("Master: {}", master);
            Ok(())
        }
        None => anyhow::bail!("no store node is reachable"),
    }
}

fn show_version() {
    println!("cerrojo v{}", env!("CARGO_PKG_VERSION"));
    println!("Distributed coordination over Redis-compatible store replicas");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Master election with anti-flap pointer and background failover");
    println!("  • Token-owned distributed locks with atomic release");
    println!("  • Token bucket throttling in a single server-side script");
    println!("  • All-or-nothing flash sale quota allocation");
    println!("  • Remote or in-process token blacklist");
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", logging.level);
    Ok(())
}
