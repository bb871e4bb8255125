//! Chat sync consumer
//!
//! (c) Softlandia 2025

use chat_sync_consumer::core::chat_store::ChatStateStore;
use chat_sync_consumer::core::dispatcher::ChatDispatcher;
use chat_sync_consumer::core::supervisor::{Supervisor, install_signal_handler};
use chat_sync_consumer::infrastructure::broker::AmqpBroker;
use chat_sync_consumer::infrastructure::cache::RedisChatCache;
use chat_sync_consumer::infrastructure::database::DatabaseConnection;
use chat_sync_consumer::infrastructure::http::HttpOutbound;
use chat_sync_consumer::infrastructure::repositories::DbChatRepository;
use chat_sync_consumer::infrastructure::settings::Settings;
use chat_sync_consumer::infrastructure::traits::ChatCache;

use anyhow::{Context, anyhow};
use di::{Injectable, ServiceCollection, existing, existing_as_self};
use log::info;
use tokio::runtime::{Builder, Runtime};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(consume(settings))
}

async fn consume(settings: Settings) -> anyhow::Result<()> {
    let database = DatabaseConnection::create(&settings).context("invalid database url")?;
    let cache = RedisChatCache::connect(&settings.redis_url)
        .await
        .context("couldn't connect to redis")?;

    let queues: Vec<String> = settings.queues.iter().map(|q| q.name.clone()).collect();

    let provider = ServiceCollection::new()
        .add(existing_as_self(settings))
        .add(existing_as_self(database))
        .add(existing::<dyn ChatCache, RedisChatCache>(Box::new(cache)))
        .add(DbChatRepository::singleton())
        .add(HttpOutbound::singleton())
        .add(ChatStateStore::singleton())
        .add(ChatDispatcher::singleton())
        .add(AmqpBroker::singleton())
        .add(Supervisor::singleton())
        .build_provider()
        .map_err(|e| anyhow!("invalid service configuration: {e}"))?;

    let supervisor = provider.get_required::<Supervisor>();
    let shutdown = install_signal_handler();

    info!("consuming {}", queues.join(", "));
    supervisor.run(shutdown).await;
    info!("Shutting down...");
    Ok(())
}
