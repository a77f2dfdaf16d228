use anyhow::Result;
use clap::Parser;
use clinic_bot::clock::{Clock, SystemClock};
use clinic_bot::crm::{Bitrix24Client, CrmGateway};
use clinic_bot::lifecycle::{Lifecycle, LifecycleSettings};
use clinic_bot::notify::{Notifier, TelegramNotifier};
use clinic_bot::scheduler::Scheduler;
use clinic_bot::webhook::{self, WebhookState};
use clinic_bot::{config, db, handlers};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.app.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot.clone()));
    let crm: Arc<dyn CrmGateway> = Arc::new(Bitrix24Client::new(&cfg.bitrix24.webhook_url)?);
    let scheduler = Scheduler::new(
        pool.clone(),
        clock.clone(),
        cfg.scheduler.max_concurrent_jobs,
        Duration::from_millis(cfg.app.poll_interval_ms),
    );
    let lifecycle = Arc::new(Lifecycle::new(
        pool,
        scheduler.clone(),
        crm,
        notifier,
        clock,
        LifecycleSettings::from_config(&cfg),
    ));

    tokio::spawn(scheduler.run(lifecycle.clone()));

    let state = WebhookState {
        lifecycle: lifecycle.clone(),
        secret: cfg.webhook.secret.clone(),
    };
    let (host, port) = (cfg.webhook.host.clone(), cfg.webhook.port);
    tokio::spawn(async move {
        if let Err(err) = webhook::serve(&host, port, state).await {
            error!(?err, "webhook server stopped");
        }
    });

    info!("starting telegram bot");
    Dispatcher::builder(bot, handlers::schema())
        .dependencies(dptree::deps![lifecycle])
        .default_handler(|_| async {})
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
