use redis::Client;
use redis::aio::ConnectionManager;

/// Connect to the Redis instance that holds shared circuit breaker state.
///
/// Issues a `PING` so a wrong URL fails at startup instead of on the first
/// breaker check.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;
    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;

    tracing::info!(reply = %pong, "Connected to Redis for breaker state");
    Ok(manager)
}
