use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sessionbot::commands::CommandRegistry;
use sessionbot::config::Config;
use sessionbot::function::RegistryApproval;
use sessionbot::functions::builtin_commands;
use sessionbot::manager::Manager;
use sessionbot::platform::telegram::TelegramPlatform;
use sessionbot::poller::Poller;
use sessionbot::scheduler::Scheduler;
use sessionbot::shutdown::StopSignal;
use sessionbot::store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sessionbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  App: {}", config.manager.app_name);
    info!("  Database: {}", config.storage.database_path.display());
    info!("  Admin: {:?}", config.telegram.admin_user_id);
    info!("  Schedules: {}", config.schedules.len());

    let store = Arc::new(SqliteStore::open(&config.storage.database_path)?);
    let platform = Arc::new(TelegramPlatform::new(
        &config.telegram.bot_token,
        config.polling.timeout_secs,
    ));
    let registry = CommandRegistry::new(builtin_commands(
        &config.manager.onboarding_keyword,
        &config.manager.command_marker,
        Arc::new(RegistryApproval),
    ));

    let stop = StopSignal::new();
    let mut manager = Manager::new(&config, store, platform.clone(), registry, stop.clone());
    manager.start().await.context("Startup recovery failed")?;

    let (tx, rx) = mpsc::unbounded_channel();

    let mut scheduler = Scheduler::new().await?;
    scheduler
        .add_command_schedules(&config.schedules, tx.clone())
        .await?;
    scheduler.start().await?;

    let poller = Poller::new(
        platform.clone(),
        platform,
        tx,
        stop.clone(),
        &config.manager.command_marker,
        config.polling.retry_delay(),
    );

    info!("Bot is starting...");
    let poller = tokio::spawn(poller.run());
    let router = tokio::spawn(manager.run(rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            stop.stop();
        }
        _ = stop.stopped() => {}
    }

    if let Err(e) = router.await {
        error!("Router task failed: {}", e);
    }
    if let Err(e) = poller.await {
        error!("Poller task failed: {}", e);
    }
    if let Err(e) = scheduler.shutdown().await {
        warn!("{:#}", e);
    }

    info!("Bot stopped");
    Ok(())
}
