//! ccrelay - pooled-account relay for the messages API
//!
//! Serves the relay, validates configuration and runs the maintenance jobs
//! on demand.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ccrelay::config::Config;
use ccrelay::health::{run_daily_reset, run_log_cleanup};
use ccrelay::pricing::format_cost;
use ccrelay::storage::{init_pool, SqliteStore};

#[derive(Parser)]
#[command(name = "ccrelay")]
#[command(about = "Pooled-account relay for the messages API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show the effective pricing table
    Pricing {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Zero today's usage counters of every account and API key
    ResetStats {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Delete request logs older than the retention window
    CleanLogs {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override the configured retention in months
        #[arg(short, long)]
        months: Option<u32>,
    },
}

impl Commands {
    fn config_path(&self) -> &str {
        match self {
            Commands::Serve { config, .. }
            | Commands::Check { config }
            | Commands::Pricing { config }
            | Commands::ResetStats { config }
            | Commands::CleanLogs { config, .. } => config,
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ccrelay={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.command.config_path().to_string();
    let loaded = Config::from_file(&config_path);
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level);

    match cli.command {
        Commands::Serve { listen, .. } => {
            tracing::info!(config = %config_path, "Loading configuration");
            let mut config = loaded?;

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            ccrelay::proxy::run_server(config).await
        }

        Commands::Check { .. } => {
            tracing::info!(config = %config_path, "Checking configuration");
            let config = loaded?;
            println!("Configuration OK");
            println!("  listen:              {}", config.server.listen);
            println!("  database:            {}", config.database.path);
            println!(
                "  upstream timeout:    {}s",
                config.relay.http_client_timeout_secs
            );
            println!(
                "  default model:       {}",
                config.relay.default_foreign_model
            );
            println!(
                "  health jobs:         {}",
                if config.health.enabled { "on" } else { "off" }
            );
            println!(
                "  log retention:       {} months",
                config.health.log_retention_months
            );
            Ok(())
        }

        Commands::Pricing { .. } => {
            let config = loaded?;
            let table = config.pricing.table();
            println!(
                "{:<32} {:>10} {:>10} {:>12} {:>11}",
                "model", "input", "output", "cache write", "cache read"
            );
            for (model, row) in table.models() {
                println!(
                    "{:<32} {:>10} {:>10} {:>12} {:>11}",
                    model,
                    format_cost(row.input),
                    format_cost(row.output),
                    format_cost(row.cache_write),
                    format_cost(row.cache_read)
                );
            }
            let row = table.default_row();
            println!(
                "{:<32} {:>10} {:>10} {:>12} {:>11}",
                "(default)",
                format_cost(row.input),
                format_cost(row.output),
                format_cost(row.cache_write),
                format_cost(row.cache_read)
            );
            println!("Rates are USD per million tokens.");
            Ok(())
        }

        Commands::ResetStats { .. } => {
            let config = loaded?;
            let store = SqliteStore::new(init_pool(&config.database.path).await?);
            let rows = run_daily_reset(&store).await?;
            println!("Reset daily counters on {} rows", rows);
            Ok(())
        }

        Commands::CleanLogs { months, .. } => {
            let config = loaded?;
            let months = months.unwrap_or(config.health.log_retention_months);
            let store = SqliteStore::new(init_pool(&config.database.path).await?);
            let deleted = run_log_cleanup(&store, months, chrono::Utc::now()).await?;
            println!("Deleted {} log entries older than {} months", deleted, months);
            Ok(())
        }
    }
}
