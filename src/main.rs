//! Polystore - Polyglot Persistence Service
//!
//! Serves the record contract over HTTP, routing every call through the
//! registry to the backend named by its database descriptor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use polystore::config::{Config, NodeConfig};
use polystore::registry::SelectorStrategy;
use polystore::{api, DriverTable, RecordApi, RecordService, Router, SearchSync, APP_NAME, APP_VERSION};

/// How long shutdown waits for in-flight search mirrors
const MIRROR_DRAIN_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// CLI
// =============================================================================

/// Polystore - one record contract over many backing stores
#[derive(Parser, Debug)]
#[command(name = APP_NAME)]
#[command(about = "Polyglot persistence service routing records to pluggable backends")]
#[command(version)]
struct Cli {
    /// HTTP API bind address
    #[arg(short, long, env = "POLYSTORE_BIND")]
    bind: Option<String>,

    /// JSON config file
    #[arg(short, long, env = "POLYSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Registry namespace for service names
    #[arg(long, env = "POLYSTORE_NAMESPACE")]
    namespace: Option<String>,

    /// Driver used when a request names none
    #[arg(long, env = "POLYSTORE_DEFAULT_DRIVER")]
    default_driver: Option<String>,

    /// Driver receiving searchable mirrors and searches
    #[arg(long, env = "POLYSTORE_SEARCH_DRIVER")]
    search_driver: Option<String>,

    /// Node selection strategy (round_robin, random)
    #[arg(long, env = "POLYSTORE_SELECTOR")]
    selector: Option<String>,

    /// Backend HTTP client timeout in seconds
    #[arg(long, env = "POLYSTORE_HTTP_TIMEOUT_SECS")]
    http_timeout_secs: Option<u64>,

    /// Backend node: id=..,driver=..,address=..[,service=..][,key=value]
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// Backend nodes separated by ';'
    #[arg(long, env = "POLYSTORE_NODES", hide = true)]
    node_list: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Layer flags and environment over the loaded config.
    fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(bind) = &self.bind {
            config.bind.clone_from(bind);
        }
        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        if let Some(driver) = &self.default_driver {
            config.default_driver.clone_from(driver);
        }
        if let Some(driver) = &self.search_driver {
            config.search_driver.clone_from(driver);
        }
        if let Some(selector) = &self.selector {
            config.selector = SelectorStrategy::parse(selector)
                .ok_or_else(|| anyhow::anyhow!("unknown selector '{selector}'"))?;
        }
        if let Some(secs) = self.http_timeout_secs {
            config.http_timeout_secs = secs;
        }
        if let Some(list) = &self.node_list {
            config.nodes.extend(NodeConfig::parse_list(list)?);
        }
        for spec in &self.nodes {
            config.nodes.push(NodeConfig::parse(spec)?);
        }
        Ok(())
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env must be loaded before clap reads env-backed flags
    let dotenv = dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    tracing::info!("Polystore v{}", APP_VERSION);
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded .env");
    }

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config)?;
    config.validate()?;

    let registry = config.registry().await;
    let drivers = DriverTable::with_defaults(config.http_timeout());
    tracing::info!(drivers = ?drivers.names(), "Drivers registered");

    let router = Router::new(Arc::new(registry), drivers)
        .with_namespace(&config.namespace)
        .with_default_driver(&config.default_driver)
        .with_selector(config.selector);
    let service = RecordService::new(Arc::new(router));
    let sync = Arc::new(
        SearchSync::new(Arc::new(service))
            .with_default_driver(&config.default_driver)
            .with_search_driver(&config.search_driver),
    );

    let app = api::router(Arc::clone(&sync) as Arc<dyn RecordApi>);

    tracing::info!("Starting HTTP server on {}", config.bind);
    let addr: std::net::SocketAddr = config.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stats = sync.tasks().stats();
    if stats.pending > 0 {
        tracing::info!(pending = stats.pending, "Draining search mirrors");
        if !sync
            .tasks()
            .wait_idle(Duration::from_secs(MIRROR_DRAIN_TIMEOUT_SECS))
            .await
        {
            tracing::warn!(pending = sync.tasks().stats().pending, "Mirrors still pending at exit");
        }
    }

    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl-C received, shutting down");
}
