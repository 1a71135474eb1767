use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tablero::config::{Config, ConfigError, LoggingConfig};
use tablero::health::TcpHealthChecker;
use tablero::routing::RouteKeyData;
use tablero::utils::{format_duration, parse_key_value};
use tablero::Tablero;

#[derive(Parser)]
#[command(name = "tablero")]
#[command(about = "Sharding router and backend session pools for a MySQL-compatible proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the backend pools and wait for ctrl-c
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
    /// Resolve shard locations for a table without touching any backend
    Route {
        #[arg(short, long)]
        config: PathBuf,
        /// Logical table name
        #[arg(short, long)]
        table: String,
        /// Route key value as name=value; repeat a name for an IN list
        #[arg(short, long = "key")]
        keys: Vec<String>,
        /// Range lookup on the table's primary key as start,end
        #[arg(short, long)]
        range: Option<String>,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_tablero(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Route {
            config,
            table,
            keys,
            range,
        } => route_dry_run(config, &table, &keys, range.as_deref())?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run_tablero(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config.logging)?;

    info!("Starting tablero v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);

    let housekeeping = config.pool.housekeeping_interval();
    let tablero = Tablero::with_tcp(config).context("Failed to initialize tablero")?;
    tablero.start();
    tablero.spawn_health_checks(Box::new(TcpHealthChecker::default()));
    info!(
        "Backend groups: {:?}, housekeeping every {}",
        tablero.groups().group_names(),
        format_duration(housekeeping)
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    warn!("Shutdown requested");

    for (name, stats) in tablero.pool_stats() {
        info!("Pool {}: {}", name, stats);
    }
    tablero.stop();
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  tablero run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            // Rules are only checked fully once they are loaded
            tablero::routing::RouteResolver::from_config(&config)?;

            println!("✓ Configuration file is valid");
            println!("  Backend groups: {}", config.backend_groups.len());
            for group in &config.backend_groups {
                println!(
                    "    {}: {} master(s), {} slave(s)",
                    group.name,
                    group.masters.len(),
                    group.slaves.len()
                );
            }
            println!("  Route rules: {}", config.routes.len());
            println!("  Tables: {}", config.tables.len());
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
                ConfigError::Inheritance(msg) => eprintln!("  Inheritance error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn route_dry_run(
    config_path: PathBuf,
    table: &str,
    keys: &[String],
    range: Option<&str>,
) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let resolver = tablero::routing::RouteResolver::from_config(&config)?;

    if let Some(range) = range {
        let (start, end) = range
            .split_once(',')
            .ok_or_else(|| anyhow!("range must be start,end"))?;
        let rule = resolver
            .table(table)
            .map(|t| t.route.clone())
            .ok_or_else(|| anyhow!("table {} is not configured", table))?;
        for route in resolver.resolve_range(table, &rule, start.trim(), end.trim())? {
            println!("{}", route);
        }
        return Ok(());
    }

    let mut values: Vec<(&str, Vec<String>)> = Vec::new();
    for pair in keys {
        let Some((name, value)) = parse_key_value(pair) else {
            bail!("invalid key {}, expected name=value", pair);
        };
        match values.iter_mut().find(|(n, _)| *n == name) {
            Some((_, list)) => list.push(value.to_string()),
            None => values.push((name, vec![value.to_string()])),
        }
    }

    let mut key_data = RouteKeyData::new();
    for (name, mut list) in values {
        let slot = key_data.init_key(name);
        match list.len() {
            1 => slot.put_value(list.remove(0)),
            _ => slot.put_values(list),
        }
    }

    for route in resolver.resolve_table(table, &key_data)?.iter() {
        println!("{}", route);
    }
    Ok(())
}

fn show_version() {
    println!("tablero v{}", env!("CARGO_PKG_VERSION"));
    println!("Sharding router and backend session pools for a MySQL-compatible proxy");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Range, modulo, hash and fixed-map shard algorithms");
    println!("  • Route rule inheritance and database range expansion");
    println!("  • Elastic per-endpoint session pools with housekeeping");
    println!("  • Weighted master/slave selection with health checks");
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.level);
    Ok(())
}
