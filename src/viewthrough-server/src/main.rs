//! View-through attribution service.
//!
//! Loads configuration, wires the store backend, runs the daily attribution
//! scheduler and serves the reporting API. `--run-once` performs a single
//! all-tenant run and exits.

use chrono::{NaiveDate, Utc};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use viewthrough_api::ApiServer;
use viewthrough_attribution::{AttributionScheduler, ReportService, ViewThroughService};
use viewthrough_core::config::AppConfig;
use viewthrough_core::types::DateRange;
use viewthrough_store::Stores;

#[derive(Parser, Debug)]
#[command(name = "viewthrough-server")]
#[command(about = "Probabilistic view-through attribution for ad platforms")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "VIEWTHROUGH__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "VIEWTHROUGH__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Run the computation for every tenant once, then exit
    #[arg(long, default_value_t = false)]
    run_once: bool,

    /// First conversion date for --run-once (YYYY-MM-DD)
    #[arg(long, requires = "end")]
    start: Option<NaiveDate>,

    /// Last conversion date for --run-once (YYYY-MM-DD)
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,

    /// Serve the API without the daily scheduler
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "viewthrough=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("View-through attribution service starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        backend = ?config.store.backend,
        window_days = config.scheduler.window_days,
        workers = config.scheduler.max_concurrent_tenants,
        "Configuration loaded"
    );

    let stores = Stores::from_config(&config).await?;
    let service = Arc::new(ViewThroughService::new(
        stores.clone(),
        config.model.clone(),
        config.scheduler.upsert_batch_size,
    ));
    let scheduler = Arc::new(AttributionScheduler::new(
        service.clone(),
        config.scheduler.clone(),
    ));

    if cli.run_once {
        let window = match (cli.start, cli.end) {
            (Some(start), Some(end)) => Some(DateRange::new(start, end)?),
            _ => None,
        };
        let summary = scheduler.run_all(window, Utc::now()).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        if summary.has_failures() {
            anyhow::bail!(
                "{} of {} tenants failed",
                summary.tenants_failed,
                summary.tenants_processed
            );
        }
        return Ok(());
    }

    if config.scheduler.enabled && !cli.no_scheduler {
        info!(
            hour_utc = config.scheduler.run_at_hour_utc,
            "Daily view-through scheduler enabled"
        );
        tokio::spawn(scheduler.clone().run_daily());
    } else {
        info!("Daily scheduler disabled");
    }

    let reports = Arc::new(ReportService::new(stores));
    let api_server = ApiServer::new(config.clone(), service, reports);

    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("View-through attribution service is ready to serve traffic");

    api_server.start_http().await?;

    Ok(())
}
