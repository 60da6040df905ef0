use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::types::SendContext;
use herald_engine::dispatcher::AlarmDispatcher;
use herald_engine::rules::PgRuleSource;
use herald_engine::store::RedisStore;
use herald_notifier::WebhookSender;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_server=info,herald_engine=info,herald_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald alarm dispatcher starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and apply migrations
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    // Connect to Redis
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    tracing::info!("Connected to Redis");

    let sender = Arc::new(WebhookSender::new(
        config.service_name.clone(),
        config.alarm.webhooks.clone(),
        config.alarm.send_timeout,
    )?);
    let rules = Arc::new(PgRuleSource::new(pool));

    let dispatcher = AlarmDispatcher::start(&config, store, rules, sender)?;

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        default_platform = %config.alarm.default_platform,
        workers = config.alarm.worker_count(),
        dry_run = config.alarm.dry_run,
        "Alarm dispatcher running"
    );

    dispatcher
        .send_biz_message(
            &SendContext::default(),
            "Service started",
            &format!("{} is up in {}", config.service_name, config.environment),
        )
        .await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    dispatcher.shutdown().await;

    tracing::info!("Herald alarm dispatcher stopped.");
    Ok(())
}
