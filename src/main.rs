//! Chaos Proxy - CLI Entry Point

use anyhow::Result;
use chaos_proxy::client::GrpcReplayClient;
use chaos_proxy::proxy::{self, ProxyState};
use chaos_proxy::{ConfigLoader, ConfigSource, Engine, ProxyConfig, Registry};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "chaos-proxy",
    about = "Fault-injection proxy for gRPC - delays, aborts, rate limits and scripted chaos",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "CONFIG_PATH",
        default_value = "chaos-proxy.yaml",
        global = true
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy
    Run {
        /// Config file poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        watch_interval_ms: u64,
    },

    /// Validate configuration and exit
    Validate,

    /// Enable or disable a rule in the configuration file
    Rule {
        #[command(subcommand)]
        action: RuleCommand,
    },

    /// Print the parsed configuration as JSON
    ShowConfig,

    /// Print the default configuration
    PrintConfig,
}

#[derive(Subcommand, Debug)]
enum RuleCommand {
    /// Enable the named rule
    Enable { name: String },
    /// Disable the named rule
    Disable { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::PrintConfig => {
            let default_config = include_str!("../demos/chaos-proxy.yaml");
            println!("{}", default_config);
            Ok(())
        }
        Command::Validate => validate(&args.config),
        Command::ShowConfig => {
            let config = load(&args.config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Rule { action } => {
            let (name, enabled) = match action {
                RuleCommand::Enable { name } => (name, true),
                RuleCommand::Disable { name } => (name, false),
            };
            let mut config = load(&args.config)?;
            config.set_rule_enabled(&name, enabled)?;
            config.write_file(&args.config)?;
            println!(
                "Rule {} {}",
                name,
                if enabled { "enabled" } else { "disabled" }
            );
            Ok(())
        }
        Command::Run { watch_interval_ms } => {
            run(&args.config, Duration::from_millis(watch_interval_ms)).await
        }
    }
}

fn load(path: &Path) -> Result<ProxyConfig> {
    if !path.exists() {
        anyhow::bail!("Configuration file not found: {:?}", path);
    }
    info!(path = ?path, "Loading configuration");
    ProxyConfig::from_file(path)
}

fn validate(path: &Path) -> Result<()> {
    let config = load(path)?;
    config.validate()?;

    // Compile once so injector-level problems surface here rather than as
    // skipped rules at runtime.
    let loader = Arc::new(ConfigLoader::empty());
    loader.store(config.clone());
    let engine = Engine::new(loader, Arc::new(Registry::with_builtins()))?;
    let compiled = engine.rule_names();
    let skipped: Vec<_> = config
        .enabled_rules()
        .filter(|r| !compiled.contains(&r.name))
        .map(|r| r.name.as_str())
        .collect();
    if !skipped.is_empty() {
        anyhow::bail!("Rules failed to compile: {}", skipped.join(", "));
    }

    println!(
        "Configuration is valid ({} rules defined, {} enabled)",
        config.rules.len(),
        compiled.len()
    );
    Ok(())
}

async fn run(path: &Path, watch_interval: Duration) -> Result<()> {
    let loader = Arc::new(ConfigLoader::from_file(path)?);
    let config = loader
        .current()
        .ok_or_else(|| anyhow::anyhow!("configuration not loaded"))?;
    config.validate()?;

    info!(path = ?loader.path(), "Watching configuration");

    let registry = Arc::new(Registry::with_builtins());
    let engine = Arc::new(Engine::with_replay_sender(
        loader.clone(),
        registry,
        Arc::new(GrpcReplayClient::new()),
    )?);

    engine.clone().spawn_reload_task();
    loader.clone().spawn_file_watcher(watch_interval);
    loader.clone().spawn_signal_handler();

    let listener = TcpListener::bind(&config.listener.address).await?;
    info!(
        listener = %config.listener.address,
        backend = %config.backend.address,
        rules = engine.rule_names().len(),
        "Starting chaos proxy"
    );

    let state = Arc::new(ProxyState::new(engine.clone(), loader));
    proxy::serve(listener, state, shutdown_signal()).await?;

    let stats = engine.stats();
    info!(
        processed = stats.calls_processed,
        matched = stats.calls_matched,
        faults = stats.faults_injected,
        "Chaos proxy stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
