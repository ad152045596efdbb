//! Durable storage for endpoint registrations
//!
//! The in-memory store is authoritative while the process runs; persistence
//! only lets registrations survive a restart.

use async_trait::async_trait;
use tokio::time::{timeout, Duration};

use nsmesh_core::models::{Endpoint, EndpointId};
use nsmesh_core::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Backend that mirrors the registry store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EndpointPersistence: Send + Sync {
    async fn save(&self, endpoint: &Endpoint) -> Result<()>;

    async fn remove(&self, endpoint_id: &EndpointId) -> Result<()>;

    /// Every stored endpoint; called once at start-up
    async fn load_all(&self) -> Result<Vec<Endpoint>>;
}

/// Redis-backed persistence
///
/// Each endpoint is a JSON string under `nsmesh:registry:endpoints:<id>`.
pub struct RedisPersistence {
    client: redis::Client,
}

impl RedisPersistence {
    /// Redis key prefix for endpoints
    const KEY_PREFIX: &'static str = "nsmesh:registry:endpoints";

    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;
        Ok(Self { client })
    }

    fn endpoint_key(endpoint_id: &EndpointId) -> String {
        format!("{}:{}", Self::KEY_PREFIX, endpoint_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))?
        .map_err(|e| Error::Persistence(format!("Redis connection failed: {e}")))
    }
}

#[async_trait]
impl EndpointPersistence for RedisPersistence {
    async fn save(&self, endpoint: &Endpoint) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = Self::endpoint_key(&endpoint.endpoint_id);
        let value = serde_json::to_string(endpoint)?;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis SET timed out".to_string()))?
        .map_err(|e| Error::Persistence(format!("Redis SET failed: {e}")))?;

        tracing::debug!(endpoint_id = %endpoint.endpoint_id, "Endpoint persisted");
        Ok(())
    }

    async fn remove(&self, endpoint_id: &EndpointId) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = Self::endpoint_key(endpoint_id);

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis::cmd("DEL").arg(&key).query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis DEL timed out".to_string()))?
        .map_err(|e| Error::Persistence(format!("Redis DEL failed: {e}")))?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Endpoint>> {
        let mut conn = self.connection().await?;

        // SCAN rather than KEYS so a large registry does not block Redis
        let pattern = format!("{}:*", Self::KEY_PREFIX);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn),
            )
            .await
            .map_err(|_| Error::Timeout("Redis SCAN timed out".to_string()))?
            .map_err(|e| Error::Persistence(format!("Redis SCAN failed: {e}")))?;

            cursor = next;
            keys.extend(batch);

            if cursor == 0 {
                break;
            }
        }

        let mut endpoints = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                redis::cmd("GET").arg(&key).query_async(&mut conn),
            )
            .await
            .map_err(|_| Error::Timeout("Redis GET timed out".to_string()))?
            .map_err(|e| Error::Persistence(format!("Redis GET failed: {e}")))?;

            let Some(value) = value else { continue };
            match serde_json::from_str::<Endpoint>(&value) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => tracing::warn!(key = %key, "Skipping unreadable endpoint record: {e}"),
            }
        }

        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_key() {
        assert_eq!(
            RedisPersistence::endpoint_key(&EndpointId::from("e1")),
            "nsmesh:registry:endpoints:e1"
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            RedisPersistence::new("not a url"),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_save_load_remove() {
        let persistence = RedisPersistence::new("redis://127.0.0.1:6379").unwrap();
        let endpoint = Endpoint::new(
            EndpointId::from("persist-test"),
            "icmp".to_string(),
            "10.0.0.1:5000".to_string(),
        );

        persistence.save(&endpoint).await.unwrap();
        let loaded = persistence.load_all().await.unwrap();
        assert!(loaded.iter().any(|e| e.endpoint_id == endpoint.endpoint_id));

        persistence.remove(&endpoint.endpoint_id).await.unwrap();
        let loaded = persistence.load_all().await.unwrap();
        assert!(loaded.iter().all(|e| e.endpoint_id != endpoint.endpoint_id));
    }
}
