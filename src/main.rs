use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use finops_costs::apis::ConfigSourceFactory;
use finops_costs::config::Config;
use finops_costs::logging;
use finops_costs::metrics::init_metrics;
use finops_costs::pipeline::{self, IngestRequest};
use finops_costs::query::{CostFilter, CostQuery};
use finops_costs::server::{start_server, AppState};
use finops_costs::storage::CsvStore;
use finops_costs::types::Provider;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "finops_costs")]
#[command(about = "Multi-cloud billing ingestion and cost query service")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (defaults to FINOPS_CONFIG, then ./finops.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the cost query and ingestion API
    Serve {
        /// Port to listen on (overrides config and FINOPS_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Fetch billing data for a date range and append it to the stores
    Ingest {
        /// First day to ingest (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last day to ingest, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,
        /// Providers to ingest (comma-separated). Available: aws, azure, gcp
        #[arg(long, value_delimiter = ',')]
        providers: Option<Vec<Provider>>,
    },
    /// Query stored costs and print them as JSON
    Query {
        #[arg(long)]
        provider: Option<Provider>,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        start_date: Option<NaiveDate>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    // Keep the guard alive so file logs are flushed on exit
    let _log_guard = logging::init_logging(&config.logging);
    init_metrics();

    let outcome = run(cli.command, config).await;
    if let Err(e) = &outcome {
        error!("{e:#}");
    }
    outcome
}

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.server.port);
            let state = AppState::from_config(&config)?;
            info!(data_dir = %config.storage.data_dir.display(), port, "starting API server");
            start_server(state, port).await
        }
        Commands::Ingest { start, end, providers } => {
            let store = Arc::new(CsvStore::new(&config.storage.data_dir));
            let factory = ConfigSourceFactory::new(config.clone());
            let request = IngestRequest { start, end, providers };
            let summary = pipeline::ingest(
                &factory,
                store,
                &config.storage.stores,
                &request,
                config.ingestion.fetch_timeout(),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Query { provider, service, start_date, end_date } => {
            let store = Arc::new(CsvStore::open_existing(&config.storage.data_dir)?);
            let query = CostQuery::new(store, config.storage.stores.clone());
            let filter = CostFilter { service, start_date, end_date, provider };
            let rows = query.fetch_all_costs(&filter)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
    }
}
