use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use changelog_sentinel::audit::{AuditLogFile, ChainSigner};
use changelog_sentinel::changelog::dn::parse_base;
use changelog_sentinel::changelog::{ChangelogIngestor, HttpChangelogSource};
use changelog_sentinel::config::AppConfig;
use changelog_sentinel::database::Database;
use changelog_sentinel::error::SentinelError;
use changelog_sentinel::notify::{AlertThrottle, NotificationDispatcher, TracingNotifier};
use changelog_sentinel::projection::DomainProjection;
use changelog_sentinel::status::{self, StatusState};

#[derive(Parser)]
#[command(name = "changelog-sentinel")]
#[command(about = "Watch the directory changelog and keep a forward-secure audit log")]
struct Cli {
    /// Configuration file (default: ./sentinel.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Suppress notifications until caught up with the changelog
    #[arg(long)]
    initial_sync: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "changelog_sentinel=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting changelog sentinel");

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.initial_sync |= cli.initial_sync;
    let base = parse_base(&config.directory.base)?;

    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    info!("Database ready at {}", config.database_url);

    if !database.is_initialized().await? {
        error!("No chain secret in {}; run init-audit-log first", config.database_url);
        return Err(SentinelError::NotInitialized.into());
    }

    let log = AuditLogFile::new(config.audit_log_path.clone());
    let signer = Arc::new(ChainSigner::new(database.pool().clone(), log));
    if let Some(serial) = signer.recover().await? {
        info!(serial, "Adopted last log line after unclean shutdown");
    }
    info!(serial = signer.current_serial().await?, "Audit chain loaded");
    config.initial_sync |= signer.initial_sync_pending().await?;

    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::new(TracingNotifier),
        config.notify.clone(),
        config.initial_sync,
    ));
    if config.initial_sync {
        info!("Initial sync-up: notifications suppressed until caught up");
    }
    let projection = Arc::new(DomainProjection::new(
        database.pool().clone(),
        base,
        Arc::clone(&dispatcher),
    ));
    let throttle = AlertThrottle::new(database.pool().clone(), config.notify.alert_throttle_secs);
    let source = Arc::new(HttpChangelogSource::new(&config.changelog)?);

    let ingestor = Arc::new(ChangelogIngestor::new(
        source,
        Arc::clone(&signer),
        projection,
        throttle,
        &config.changelog,
    ));

    if let Some(addr) = config.status.listen {
        let state = StatusState {
            signer: Arc::clone(&signer),
            dispatcher: Arc::clone(&dispatcher),
        };
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, state).await {
                error!("Status endpoint failed: {}", e);
            }
        });
    }

    ingestor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await;

    Ok(())
}
