//! dnsroute CLI
//!
//! Runs the split-horizon DNS proxy and administers its pattern files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dnsroute_engine::{Config, Engine};

mod admin;

/// dnsroute - split-horizon DNS proxy feeding ipset
#[derive(Parser)]
#[command(name = "dnsroute")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dnsroute.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); defaults to the config's
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the DNS proxy
    Run,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "dnsroute.toml")]
        output: PathBuf,
    },

    /// Show which class and upstream a domain is routed to
    Classify {
        domain: String,
    },

    /// Edit routing patterns
    Pattern {
        #[command(subcommand)]
        command: PatternCommands,
    },

    /// Show recorded domains containing a pattern
    Lookup {
        pattern: String,
    },

    /// Show the most recent audit log rows
    Log {
        /// Number of rows
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum PatternCommands {
    /// Route a pattern through a class, moving it out of any other class
    Add { class: String, pattern: String },

    /// Stop routing a pattern through a class
    Remove { class: String, pattern: String },

    /// List every class's patterns
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenConfig { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"));
        return generate_config(output);
    }

    let config = load_config(&cli.config)?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    match cli.command {
        Commands::Run => run(config, &cli.config).await,
        Commands::GenConfig { .. } => Ok(()),
        Commands::Classify { domain } => admin::classify(&config, &domain).await,
        Commands::Pattern { command } => match command {
            PatternCommands::Add { class, pattern } => {
                admin::add_pattern(&config, &class, &pattern).await
            }
            PatternCommands::Remove { class, pattern } => {
                admin::remove_pattern(&config, &class, &pattern).await
            }
            PatternCommands::List => admin::list_patterns(&config).await,
        },
        Commands::Lookup { pattern } => admin::lookup(&config, &pattern).await,
        Commands::Log { limit } => admin::show_log(&config, limit),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: Config, config_path: &Path) -> Result<()> {
    info!("Starting dnsroute...");

    let mut engine = Engine::new(config).context("Failed to create routing engine")?;

    info!("Configuration loaded from {:?}", config_path);

    // Create shutdown handle before moving engine into task
    let shutdown_tx = engine.create_shutdown_handle();

    let mut engine_handle = tokio::spawn(async move { engine.run().await });

    tokio::select! {
        _ = wait_for_shutdown() => {}
        result = &mut engine_handle => {
            // The engine only returns early on a startup failure
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("Routing engine failed"),
                Err(e) => Err(e).context("Routing engine task panicked"),
            };
        }
    }

    info!("Shutting down...");

    // Signal graceful shutdown; the engine flushes its snapshots before returning
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(std::time::Duration::from_secs(5), engine_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Routing engine error: {}", e),
        Ok(Err(e)) => error!("Routing engine task failed: {}", e),
        Err(_) => error!("Timed out waiting for final snapshot flush"),
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the routing classes and upstreams before running.");

    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT");
        }
    }
}
