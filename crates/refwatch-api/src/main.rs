//! refwatch server: periodic synchronization plus webhook receiver.

use clap::Parser;
use refwatch_api::{AppState, routes};
use refwatch_config::{DEFAULT_CONFIG_PATH, RepositoryConfig, load_config};
use refwatch_db::{
    BranchStore, BuildStore, MemoryStore, PgBranchStore, PgBuildStore, create_pool,
    run_migrations,
};
use refwatch_hosting::HostingBackends;
use refwatch_scheduler::{Poller, RepositoryRegistry, SyncEngine, status_channel};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Pending webhook wake-ups before new ones are dropped.
const WAKE_QUEUE: usize = 64;

#[derive(Parser)]
#[command(name = "refwatch-server")]
#[command(about = "Synchronize repositories and admit builds")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "REFWATCH_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = load_config(&args.config)?;
    info!(
        config = %args.config.display(),
        repositories = config.repositories.len(),
        "Loaded configuration"
    );

    let branches: Arc<dyn BranchStore>;
    let builds: Arc<dyn BuildStore>;
    match &config.server.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            branches = Arc::new(PgBranchStore::new(pool.clone()));
            builds = Arc::new(PgBuildStore::new(pool));
        }
        None => {
            warn!("No database configured, state is kept in memory");
            let store = Arc::new(MemoryStore::new());
            branches = store.clone();
            builds = store;
        }
    }

    let backends = Arc::new(HostingBackends::new(
        config.server.work_dir.clone(),
        config.server.status_url.clone(),
    ));
    let (statuses, reporter) = status_channel(backends.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Arc::new(
        SyncEngine::new(branches, builds, backends, statuses).with_shutdown(shutdown_rx.clone()),
    );
    let registry = Arc::new(RepositoryRegistry::new(
        config
            .repositories
            .into_iter()
            .map(RepositoryConfig::into_repository),
    ));

    let (wake_tx, wake_rx) = mpsc::channel(WAKE_QUEUE);
    let poller = Poller::new(
        engine.clone(),
        registry.clone(),
        config.server.poll_interval(),
        shutdown_rx,
    );
    let poller_handle = tokio::spawn(poller.run(wake_rx));
    let reporter_handle = tokio::spawn(reporter.run());

    let app = routes::router(AppState::new(registry, wake_tx)).layer(TraceLayer::new_for_http());

    info!("Starting server on {}", config.server.listen);
    let listener = TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    poller_handle.await?;
    // The reporter drains once the last status queue is gone.
    drop(engine);
    reporter_handle.await?;

    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
    shutdown.send_replace(true);
}
