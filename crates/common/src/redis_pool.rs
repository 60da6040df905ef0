use redis::Client;
use redis::aio::ConnectionManager;

/// Connect to the shared queue store and verify it answers `PING`.
///
/// The returned manager reconnects on its own and is cheap to clone, so one
/// instance is shared by the dispatcher, its workers and the promoter.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, "Connected to Redis");
    Ok(manager)
}
