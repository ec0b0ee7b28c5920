use async_trait::async_trait;
use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use std::fmt;
use std::time::Duration;

use super::CacheBackend;
use crate::Result;
use crate::cache::KEY_NAMESPACE;

/// Cache backend storing records in Redis.
///
/// Several processes can share one Redis instance; their caches are then
/// eventually consistent with each other. Expiry is delegated to Redis.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    address: String,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to the Redis server at `url`
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let address = client.get_connection_info().addr.to_string();
        let connection = ConnectionManager::new(client).await?;
        log::info!("Connected to Redis cache at {address}");
        Ok(Self {
            connection,
            address,
        })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        Ok(connection.get(key).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut connection = self.connection.clone();
        // Redis expiry has second granularity
        let seconds = ttl.as_secs().max(1);
        let () = connection.set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        let removed: u64 = connection.del(key).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut connection = self.connection.clone();
        let mut keys = Vec::new();
        let mut iter = connection.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn flush(&self) -> Result<()> {
        let keys = self.keys(&format!("{KEY_NAMESPACE}:*")).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.clone();
        let _: u64 = connection.del(keys).await?;
        Ok(())
    }
}
